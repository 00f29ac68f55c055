//! HTTP server: static pages, audio streams, status and long-poll
//! notifications, playlist control.
//!
//! One request per connection (HTTP/1.0, `Connection: close`). Every
//! response is queued and the connection closes once it has drained.

pub mod request;
pub mod response;

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde_json::json;

pub use request::{ParseStatus, Request, RequestParser};
pub use response::ResponseHead;

use crate::coordinator::{CallbackControl, Coordinator, DeviceEvent, SeekOrigin};
use crate::error::{TandemError, TandemResult};
use crate::net::{ConnectionContext, Handler, HandlerFactory, OutputQueue, OutputSource};
use crate::protocol_constants::{DEFAULT_GROUP, STREAM_PATH};

/// Creates an [`HttpHandler`] per accepted connection.
pub struct HttpFactory {
    coordinator: Arc<Coordinator>,
    html_root: PathBuf,
}

impl HttpFactory {
    pub fn new(coordinator: Arc<Coordinator>, html_root: impl Into<PathBuf>) -> Self {
        Self {
            coordinator,
            html_root: html_root.into(),
        }
    }
}

impl HandlerFactory for HttpFactory {
    type Handler = HttpHandler;

    fn new_handler(&mut self, ctx: &ConnectionContext) -> HttpHandler {
        HttpHandler {
            coordinator: Arc::clone(&self.coordinator),
            html_root: self.html_root.clone(),
            peer: ctx.peer,
            parser: RequestParser::new(),
            responded: false,
        }
    }
}

/// Request state for one HTTP connection.
pub struct HttpHandler {
    coordinator: Arc<Coordinator>,
    html_root: PathBuf,
    peer: SocketAddr,
    parser: RequestParser,
    responded: bool,
}

impl Handler for HttpHandler {
    fn process_inbound(&mut self, bytes: &[u8], out: &mut OutputQueue) -> bool {
        if self.responded {
            // Pipelined input after the one request we answer.
            return true;
        }

        let result = match self.parser.push(bytes) {
            ParseStatus::Incomplete => return true,
            ParseStatus::TooLarge => Err(TandemError::RequestTooLarge),
            ParseStatus::Invalid(reason) => Err(TandemError::InvalidRequest(reason.to_string())),
            ParseStatus::Complete(request) => {
                log::debug!("[Http] {} {} from {}", request.method, request.path, self.peer);
                self.route(&request, out)
            }
        };

        if let Err(e) = result {
            log::debug!("[Http] {} -> {}", self.peer, e);
            out.enqueue(response::error(&e));
        }
        self.responded = true;
        out.close_after_drain();
        true
    }
}

impl HttpHandler {
    fn route(&self, req: &Request, out: &mut OutputQueue) -> TandemResult<()> {
        if req.method != "GET" {
            return Err(TandemError::MethodNotAllowed(req.method.clone()));
        }

        match req.path.as_str() {
            "/" => self.serve_static("index.html", out),
            STREAM_PATH => self.stream(req, out),
            "/status" => self.status(req, out),
            "/notify" => self.notify(req, out),
            "/playlist" => self.playlist(req, out),
            "/control" => self.control(req, out),
            path => match path.strip_prefix("/html/") {
                Some(rel) => self.serve_static(rel, out),
                None => Err(TandemError::NotFound(path.to_string())),
            },
        }
    }

    fn serve_static(&self, rel: &str, out: &mut OutputQueue) -> TandemResult<()> {
        let rel_path = Path::new(rel);
        if !rel_path.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(TandemError::Forbidden(rel.to_string()));
        }
        let path = self.html_root.join(rel_path);
        serve_file(&path, response::mime_for(&path), None, out)
    }

    fn stream(&self, req: &Request, out: &mut OutputQueue) -> TandemResult<()> {
        let player = required(req, "player")?;
        let group = self
            .coordinator
            .current_group(player)
            .ok_or_else(|| TandemError::DeviceNotFound(player.to_string()))?;
        let track = self
            .coordinator
            .current_track(&group)
            .filter(|t| !t.is_remote())
            .ok_or_else(|| TandemError::NotFound(format!("no local track for group '{group}'")))?;

        log::info!("[Http] Streaming {} to {}", track.url, player);
        serve_file(
            Path::new(&track.url),
            track.format.mime_type(),
            req.byte_range(),
            out,
        )
    }

    fn status(&self, req: &Request, out: &mut OutputQueue) -> TandemResult<()> {
        let body = match req.query_param("player") {
            Some(player) => {
                let snapshot = self
                    .coordinator
                    .device_snapshot(player)
                    .ok_or_else(|| TandemError::DeviceNotFound(player.to_string()))?;
                response::json(200, &snapshot)
            }
            None => response::json(
                200,
                &json!({
                    "devices": self.coordinator.list_devices(),
                    "groups": self.coordinator.group_names(),
                }),
            ),
        };
        out.enqueue(body);
        Ok(())
    }

    /// Long poll: answers with the player's snapshot on its next change.
    fn notify(&self, req: &Request, out: &mut OutputQueue) -> TandemResult<()> {
        let player = required(req, "player")?;
        if self.coordinator.device(player).is_none() {
            return Err(TandemError::DeviceNotFound(player.to_string()));
        }

        let (source, completer) = OutputSource::deferred();
        let mut completer = Some(completer);
        let client_id = player.to_string();
        let guard = self.coordinator.watch(
            player,
            Box::new(move |event| {
                if let Some(completer) = completer.take() {
                    let body = match event {
                        DeviceEvent::Changed(snapshot) => response::json(200, snapshot),
                        DeviceEvent::Removed => {
                            response::error(&TandemError::DeviceNotFound(client_id.clone()))
                        }
                    };
                    completer.complete(body);
                }
                CallbackControl::Done
            }),
        );

        // The device may have left between the check and the registration.
        if self.coordinator.device(player).is_none() {
            drop(guard);
            return Err(TandemError::DeviceNotFound(player.to_string()));
        }

        out.enqueue(source.with_guard(guard));
        out.pause_inbound_until_drained();
        Ok(())
    }

    fn playlist(&self, req: &Request, out: &mut OutputQueue) -> TandemResult<()> {
        let group = self.target_group(req);
        let playlist = self.coordinator.playlist(&group)?;
        out.enqueue(response::json(200, &playlist));
        Ok(())
    }

    fn control(&self, req: &Request, out: &mut OutputQueue) -> TandemResult<()> {
        let group = self.target_group(req);
        let cmd = required(req, "cmd")?;
        let coordinator = &self.coordinator;

        let result = match cmd {
            "next" | "prev" | "play" => {
                let offset = match cmd {
                    "next" => 1,
                    "prev" => -1,
                    _ => 0,
                };
                let outcome = coordinator.advance(&group, offset, SeekOrigin::FromCurrent, true)?;
                json!({ "index": outcome.index, "atEnd": outcome.at_end })
            }
            "stop" => json!({ "devices": coordinator.stop_group(&group)? }),
            "repeat_on" | "repeat_off" => {
                coordinator.set_repeat(&group, cmd == "repeat_on")?;
                json!({ "repeat": cmd == "repeat_on" })
            }
            "volume" => {
                let player = required(req, "player")?;
                let volume: u8 = required(req, "value")?
                    .parse()
                    .map_err(|_| TandemError::InvalidRequest("value must be 0-100".into()))?;
                let device = coordinator
                    .device(player)
                    .ok_or_else(|| TandemError::DeviceNotFound(player.to_string()))?;
                device.set_volume(volume);
                coordinator.notify_device_changed(player);
                json!({ "volume": volume.min(100) })
            }
            other => return Err(TandemError::InvalidRequest(format!("unknown command: {other}"))),
        };

        log::info!("[Http] Control '{}' on group '{}'", cmd, group);
        let mut body = json!({ "group": group, "cmd": cmd });
        if let (Some(body), Some(extra)) = (body.as_object_mut(), result.as_object()) {
            body.extend(extra.clone());
        }
        out.enqueue(response::json(200, &body));
        Ok(())
    }

    /// `group=` if given, else the group `player=` follows, else the default.
    fn target_group(&self, req: &Request) -> String {
        req.query_param("group")
            .map(str::to_string)
            .or_else(|| {
                req.query_param("player")
                    .and_then(|p| self.coordinator.current_group(p))
            })
            .unwrap_or_else(|| DEFAULT_GROUP.to_string())
    }
}

fn required<'a>(req: &'a Request, name: &str) -> TandemResult<&'a str> {
    req.query_param(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| TandemError::InvalidRequest(format!("missing '{name}' parameter")))
}

/// Queues a file response, honouring an optional byte range.
fn serve_file(
    path: &Path,
    mime: &str,
    range: Option<(u64, Option<u64>)>,
    out: &mut OutputQueue,
) -> TandemResult<()> {
    let size = match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return Err(TandemError::NotFound(path.display().to_string())),
    };

    let Some((start, end)) = range else {
        out.enqueue(
            ResponseHead::new(200)
                .content_type(mime)
                .content_length(size)
                .encode(),
        );
        out.enqueue(OutputSource::file(path));
        return Ok(());
    };

    if start >= size {
        out.enqueue(response::with_body(
            ResponseHead::new(416).header("Content-Range", format!("bytes */{size}")),
            b"",
        ));
        return Ok(());
    }
    let end = end.unwrap_or(u64::MAX).min(size - 1);
    let len = end - start + 1;
    out.enqueue(
        ResponseHead::new(206)
            .content_type(mime)
            .content_length(len)
            .header("Content-Range", format!("bytes {start}-{end}/{size}"))
            .encode(),
    );
    out.enqueue(OutputSource::file_range(path, start, Some(len)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::Weak;
    use std::thread::JoinHandle;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::config::ReactorConfig;
    use crate::coordinator::{DeviceControl, DeviceStatus, Track};
    use crate::net::{Reactor, ReactorHandle};

    struct StubDevice {
        id: String,
        status: Mutex<DeviceStatus>,
    }

    impl DeviceControl for StubDevice {
        fn client_id(&self) -> &str {
            &self.id
        }
        fn play(&self) {}
        fn stop(&self) {}
        fn pause(&self, _paused: bool) {}
        fn set_volume(&self, volume: u8) {
            self.status.lock().volume = volume;
        }
        fn status(&self) -> DeviceStatus {
            *self.status.lock()
        }
    }

    struct Harness {
        coordinator: Arc<Coordinator>,
        handle: ReactorHandle,
        thread: Option<JoinHandle<()>>,
        html: tempfile::TempDir,
    }

    impl Harness {
        fn start() -> Self {
            let html = tempfile::tempdir().unwrap();
            std::fs::write(html.path().join("index.html"), "<h1>tandem</h1>").unwrap();
            std::fs::write(html.path().join("app.js"), "go()").unwrap();

            let coordinator = Arc::new(Coordinator::in_memory());
            let config = ReactorConfig {
                bind_addr: "127.0.0.1".parse().unwrap(),
                poll_timeout_ms: 50,
                ..ReactorConfig::default()
            };
            let factory = HttpFactory::new(Arc::clone(&coordinator), html.path());
            let reactor = Reactor::bind("http", &config, factory).unwrap();
            let handle = reactor.handle();
            let thread = Some(reactor.spawn().unwrap());
            Self {
                coordinator,
                handle,
                thread,
                html,
            }
        }

        fn add_device(&self, id: &str) -> Arc<StubDevice> {
            let device = Arc::new(StubDevice {
                id: id.to_string(),
                status: Mutex::new(DeviceStatus::default()),
            });
            let weak: Weak<dyn DeviceControl> = Arc::downgrade(&device) as Weak<dyn DeviceControl>;
            self.coordinator.add_device(id, weak);
            device
        }

        fn send(&self, raw: &str) -> TcpStream {
            let mut stream = TcpStream::connect(self.handle.local_addr()).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream.write_all(raw.as_bytes()).unwrap();
            stream
        }

        fn get(&self, target: &str) -> (u16, String, Vec<u8>) {
            read_response(self.send(&format!("GET {target} HTTP/1.0\r\n\r\n")))
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.handle.stop();
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn read_response(mut stream: TcpStream) -> (u16, String, Vec<u8>) {
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).unwrap();
        let split = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        let head = String::from_utf8(raw[..split].to_vec()).unwrap();
        let status = head[9..12].parse().unwrap();
        (status, head, raw[split + 4..].to_vec())
    }

    fn json_body(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Static files and errors
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn serves_index_and_static_files() {
        let harness = Harness::start();

        let (status, head, body) = harness.get("/");
        assert_eq!(status, 200);
        assert!(head.contains("Content-Type: text/html"));
        assert_eq!(body, b"<h1>tandem</h1>");

        let (status, head, body) = harness.get("/html/app.js");
        assert_eq!(status, 200);
        assert!(head.contains("Content-Length: 4"));
        assert_eq!(body, b"go()");
    }

    #[test]
    fn error_statuses() {
        let harness = Harness::start();
        assert_eq!(harness.get("/nope").0, 404);
        assert_eq!(harness.get("/html/missing.css").0, 404);
        assert_eq!(harness.get("/html/../index.html").0, 403);
        assert_eq!(harness.get("/html/%2E%2E/index.html").0, 403);
        assert_eq!(harness.get("/status?player=ghost").0, 404);
        assert_eq!(harness.get("/control?cmd=dance").0, 400);

        let (status, _, body) = read_response(harness.send("POST / HTTP/1.0\r\n\r\n"));
        assert_eq!(status, 405);
        assert_eq!(json_body(&body)["error"], "method_not_allowed");

        assert_eq!(read_response(harness.send("nonsense\r\n\r\n")).0, 400);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Streaming
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn streams_current_track_with_ranges() {
        let harness = Harness::start();
        let track_path = harness.html.path().join("song.mp3");
        std::fs::write(&track_path, b"0123456789").unwrap();
        harness
            .coordinator
            .replace_playlist("all", vec![Track::from_path(track_path.display().to_string())])
            .unwrap();
        let _device = harness.add_device("aa:bb");

        let (status, head, body) = harness.get("/stream.mp3?player=aa:bb");
        assert_eq!(status, 200);
        assert!(head.contains("Content-Type: audio/mpeg"));
        assert_eq!(body, b"0123456789");

        let stream = harness.send(
            "GET /stream.mp3?player=aa:bb HTTP/1.0\r\nRange: bytes=4-\r\n\r\n",
        );
        let (status, head, body) = read_response(stream);
        assert_eq!(status, 206);
        assert!(head.contains("Content-Range: bytes 4-9/10"));
        assert_eq!(body, b"456789");

        let stream = harness.send(
            "GET /stream.mp3?player=aa:bb HTTP/1.0\r\nRange: bytes=50-\r\n\r\n",
        );
        assert_eq!(read_response(stream).0, 416);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status and long poll
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn status_lists_devices_and_groups() {
        let harness = Harness::start();
        let _device = harness.add_device("aa:bb");

        let (status, _, body) = harness.get("/status");
        assert_eq!(status, 200);
        let value = json_body(&body);
        assert_eq!(value["devices"][0]["clientId"], "aa:bb");
        assert_eq!(value["groups"][0], "all");

        let (_, _, body) = harness.get("/status?player=aa:bb");
        assert_eq!(json_body(&body)["group"], "all");
    }

    #[test]
    fn notify_completes_on_next_change() {
        let harness = Harness::start();
        let device = harness.add_device("aa:bb");

        let stream = harness.send("GET /notify?player=aa:bb HTTP/1.0\r\n\r\n");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while harness.coordinator.pending_notifications() == 0 {
            assert!(std::time::Instant::now() < deadline, "poll never registered");
            std::thread::sleep(Duration::from_millis(5));
        }

        device.set_volume(70);
        assert_eq!(harness.coordinator.notify_device_changed("aa:bb"), 1);

        let (status, _, body) = read_response(stream);
        assert_eq!(status, 200);
        let value = json_body(&body);
        assert_eq!(value["clientId"], "aa:bb");
        assert_eq!(value["status"]["volume"], 70);
        assert_eq!(harness.coordinator.pending_notifications(), 0);
    }

    #[test]
    fn notify_answers_404_when_device_leaves() {
        let harness = Harness::start();
        let _device = harness.add_device("aa:bb");

        let stream = harness.send("GET /notify?player=aa:bb HTTP/1.0\r\n\r\n");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while harness.coordinator.pending_notifications() == 0 {
            assert!(std::time::Instant::now() < deadline, "poll never registered");
            std::thread::sleep(Duration::from_millis(5));
        }

        harness.coordinator.remove_device("aa:bb");
        harness.coordinator.notify_device_changed("aa:bb");
        assert_eq!(read_response(stream).0, 404);
    }

    #[test]
    fn closing_a_long_poll_unregisters_it() {
        let harness = Harness::start();
        let _device = harness.add_device("aa:bb");

        let stream = harness.send("GET /notify?player=aa:bb HTTP/1.0\r\n\r\n");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while harness.coordinator.pending_notifications() == 0 {
            assert!(std::time::Instant::now() < deadline, "poll never registered");
            std::thread::sleep(Duration::from_millis(5));
        }

        drop(stream);
        while harness.coordinator.pending_notifications() != 0 {
            assert!(std::time::Instant::now() < deadline, "poll never unregistered");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Playlist control
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn control_advances_and_toggles_repeat() {
        let harness = Harness::start();
        harness
            .coordinator
            .replace_playlist(
                "all",
                vec![Track::from_path("/m/a.mp3"), Track::from_path("/m/b.mp3")],
            )
            .unwrap();

        let (status, _, body) = harness.get("/control?cmd=next");
        assert_eq!(status, 200);
        let value = json_body(&body);
        assert_eq!(value["group"], "all");
        assert_eq!(value["index"], 1);
        assert_eq!(value["atEnd"], false);

        let (_, _, body) = harness.get("/control?group=all&cmd=repeat_on");
        assert_eq!(json_body(&body)["repeat"], true);

        let (_, _, body) = harness.get("/playlist?group=all");
        let value = json_body(&body);
        assert_eq!(value["current"], 1);
        assert_eq!(value["repeat"], true);
        assert_eq!(value["tracks"].as_array().unwrap().len(), 2);

        assert_eq!(harness.get("/control?group=den&cmd=next").0, 404);
    }
}

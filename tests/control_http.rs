use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use crossbeam_channel::Receiver;

use ptz_engine::{CameraDescriptor, CameraEngine, CommandDispatcher, EngineConfig, PtzCommand};

struct RecordedRequest {
    request_line: String,
    headers: Vec<(String, String)>,
}

impl RecordedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Serves `count` requests with `status_line`, recording each one.
fn fake_camera(status_line: &'static str, count: usize) -> (SocketAddr, Receiver<RecordedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake camera");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        for _ in 0..count {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
            let mut request_line = String::new();
            reader.read_line(&mut request_line).expect("request line");
            let mut headers = Vec::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).expect("header line") == 0 {
                    break;
                }
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((key, value)) = line.split_once(':') {
                    headers.push((key.trim().to_string(), value.trim().to_string()));
                }
            }
            let mut stream = stream;
            let _ = write!(
                stream,
                "{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                status_line
            );
            let _ = tx.send(RecordedRequest {
                request_line: request_line.trim_end().to_string(),
                headers,
            });
        }
    });
    (addr, rx)
}

fn camera(addr: SocketAddr) -> CameraDescriptor {
    CameraDescriptor::new("cam-1", "rtsp://cam/stream")
        .with_control_url(format!("http://{}/axis-cgi/com/ptz.cgi", addr))
        .with_credentials("a", "b")
}

#[test]
fn move_is_clamped_and_authenticated() {
    let (addr, requests) = fake_camera("HTTP/1.1 200 OK", 1);
    let dispatcher = CommandDispatcher::new(&EngineConfig::default());

    let status = dispatcher
        .send(&camera(addr), &PtzCommand::pan_tilt(2.5, -3.0))
        .expect("send move");
    assert_eq!(status, Some(200));

    let request = requests.recv_timeout(Duration::from_secs(5)).expect("request");
    assert_eq!(
        request.request_line,
        "GET /axis-cgi/com/ptz.cgi?continuouspantiltmove=1.0%2C-1.0 HTTP/1.1"
    );
    assert_eq!(request.header("authorization"), Some("Basic YTpi"));
    assert!(request
        .header("user-agent")
        .is_some_and(|agent| agent.starts_with("ptz-engine/")));
}

#[test]
fn rejected_command_is_an_error() {
    let (addr, _requests) = fake_camera("HTTP/1.1 401 Unauthorized", 1);
    let dispatcher = CommandDispatcher::new(&EngineConfig::default());
    let err = dispatcher
        .send(&camera(addr), &PtzCommand::StopMotion)
        .expect_err("401 must fail");
    assert!(format!("{:#}", err).contains("401"));
}

#[test]
fn no_credentials_means_no_authorization_header() {
    let (addr, requests) = fake_camera("HTTP/1.1 200 OK", 1);
    let dispatcher = CommandDispatcher::new(&EngineConfig::default());
    let camera = CameraDescriptor::new("cam-2", "rtsp://cam/stream")
        .with_control_url(format!("http://{}/ptz.cgi", addr));

    dispatcher
        .send(&camera, &PtzCommand::zoom(0.5))
        .expect("send zoom");
    let request = requests.recv_timeout(Duration::from_secs(5)).expect("request");
    assert_eq!(request.request_line, "GET /ptz.cgi?continuouszoommove=0.5 HTTP/1.1");
    assert_eq!(request.header("authorization"), None);
}

#[test]
fn engine_commands_reach_the_camera_in_order() {
    let (addr, requests) = fake_camera("HTTP/1.1 204 No Content", 3);
    let mut engine = CameraEngine::new(EngineConfig::default()).expect("engine");
    let camera = camera(addr);

    engine.send_move(&camera, 0.25, -0.5);
    engine.send_goto_preset(&camera, "North Gate");
    engine.send_stop_motion(&camera);

    let lines: Vec<String> = (0..3)
        .map(|_| {
            requests
                .recv_timeout(Duration::from_secs(5))
                .expect("request")
                .request_line
        })
        .collect();
    assert_eq!(
        lines,
        vec![
            "GET /axis-cgi/com/ptz.cgi?continuouspantiltmove=0.25%2C-0.5 HTTP/1.1",
            "GET /axis-cgi/com/ptz.cgi?gotopresetname=North+Gate HTTP/1.1",
            "GET /axis-cgi/com/ptz.cgi?continuouspantiltmove=0%2C0&continuouszoommove=0 HTTP/1.1",
        ]
    );
    engine.shutdown().expect("shutdown");
}

#[test]
fn unreachable_camera_does_not_disturb_the_engine() {
    let mut engine = CameraEngine::new(EngineConfig {
        http_timeout: Duration::from_millis(300),
        ..EngineConfig::default()
    })
    .expect("engine");
    let camera = CameraDescriptor::new("cam-3", "rtsp://cam/stream")
        .with_control_url("http://127.0.0.1:9/ptz.cgi");

    engine.send_move(&camera, 1.0, 0.0);
    engine.send_stop_motion(&camera);
    assert!(engine.session_snapshot().is_some());
    engine.shutdown().expect("shutdown");
}

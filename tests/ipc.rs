use candle_core::Tensor;
use image::{DynamicImage, RgbImage};
use medscan::ipc::{send_command, socket_path, ControlMessage, SOCKET_ENV};
use medscan::predictor::{PredictionJson, PredictorSettings};
use medscan::{daemon, Classifier, Label, PredictionOutput, Predictor};
use serial_test::serial;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::tempdir;

struct Fixed(f32);

impl Classifier for Fixed {
    fn probability(&self, _input: &Tensor) -> medscan::Result<f32> {
        Ok(self.0)
    }
}

/// Takes a while to answer, like a large model on a slow CPU.
struct Slow(f32, Duration);

impl Classifier for Slow {
    fn probability(&self, _input: &Tensor) -> medscan::Result<f32> {
        thread::sleep(self.1);
        Ok(self.0)
    }
}

fn start_daemon(socket: &Path, predictor: Predictor) -> JoinHandle<std::io::Result<()>> {
    std::env::set_var(SOCKET_ENV, socket);
    let listener = UnixListener::bind(socket).unwrap();
    thread::spawn(move || daemon::serve(listener, Arc::new(predictor)))
}

fn write_png(path: &Path) {
    DynamicImage::ImageRgb8(RgbImage::new(12, 12)).save(path).unwrap();
}

#[test]
#[serial]
fn socket_uses_env_variable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sockenv");
    std::env::set_var(SOCKET_ENV, &path);
    std::env::remove_var("XDG_RUNTIME_DIR");
    assert_eq!(socket_path(), path);
}

#[test]
#[serial]
fn socket_uses_runtime_dir() {
    let dir = tempdir().unwrap();
    std::env::remove_var(SOCKET_ENV);
    std::env::set_var("XDG_RUNTIME_DIR", dir.path());
    assert_eq!(socket_path(), dir.path().join("medscan.sock"));
}

#[test]
#[serial]
fn socket_falls_back_to_tempdir() {
    std::env::remove_var(SOCKET_ENV);
    std::env::remove_var("XDG_RUNTIME_DIR");
    assert_eq!(socket_path(), std::env::temp_dir().join("medscan.sock"));
}

#[test]
#[serial]
fn daemon_answers_until_shutdown() {
    let dir = tempdir().unwrap();
    let settings = PredictorSettings {
        threshold: 0.85,
        ..Default::default()
    };
    let predictor = Predictor::new(Box::new(Fixed(0.9)), Box::new(Fixed(0.85)), settings).unwrap();
    let handle = start_daemon(&dir.path().join("sock"), predictor);

    let image = dir.path().join("xray.png");
    write_png(&image);
    let reply = send_command(&ControlMessage::Diagnose(image)).unwrap().unwrap();
    let out: PredictionOutput = serde_json::from_str(&reply).unwrap();
    match out {
        PredictionOutput::Report(PredictionJson {
            tb_diagnosis,
            dr_diagnosis,
            ..
        }) => {
            assert_eq!(tb_diagnosis, Label::Positive);
            assert_eq!(dr_diagnosis, Label::Negative);
        }
        other => panic!("unexpected reply {other:?}"),
    }

    let bogus = dir.path().join("missing.png");
    let reply = send_command(&ControlMessage::Diagnose(bogus)).unwrap().unwrap();
    let out: PredictionOutput = serde_json::from_str(&reply).unwrap();
    assert!(out.is_error());

    let pong = send_command(&ControlMessage::Ping).unwrap();
    assert_eq!(pong.as_deref(), Some("\"pong\""));

    assert_eq!(send_command(&ControlMessage::Shutdown).unwrap(), None);
    handle.join().unwrap().unwrap();
}

#[test]
#[serial]
fn idle_client_does_not_block_others() {
    let dir = tempdir().unwrap();
    let socket = dir.path().join("sock");
    let predictor = Predictor::new(
        Box::new(Fixed(0.1)),
        Box::new(Fixed(0.1)),
        PredictorSettings::default(),
    )
    .unwrap();
    let handle = start_daemon(&socket, predictor);

    // connects and never writes
    let idle = UnixStream::connect(&socket).unwrap();

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(send_command(&ControlMessage::Ping).unwrap());
    });
    let pong = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(pong.as_deref(), Some("\"pong\""));

    drop(idle);
    assert_eq!(send_command(&ControlMessage::Shutdown).unwrap(), None);
    handle.join().unwrap().unwrap();
}

#[test]
#[serial]
fn shutdown_waits_for_running_diagnosis() {
    let dir = tempdir().unwrap();
    let delay = Duration::from_millis(300);
    let predictor = Predictor::new(
        Box::new(Slow(0.9, delay)),
        Box::new(Slow(0.2, delay)),
        PredictorSettings::default(),
    )
    .unwrap();
    let handle = start_daemon(&dir.path().join("sock"), predictor);

    let image = dir.path().join("fundus.png");
    write_png(&image);
    let client = thread::spawn(move || send_command(&ControlMessage::Diagnose(image)));

    thread::sleep(Duration::from_millis(150));
    assert_eq!(send_command(&ControlMessage::Shutdown).unwrap(), None);
    handle.join().unwrap().unwrap();

    let reply = client.join().unwrap().unwrap().unwrap();
    match serde_json::from_str::<PredictionOutput>(&reply).unwrap() {
        PredictionOutput::Report(PredictionJson {
            tb_diagnosis,
            dr_diagnosis,
            ..
        }) => {
            assert_eq!(tb_diagnosis, Label::Positive);
            assert_eq!(dr_diagnosis, Label::Negative);
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

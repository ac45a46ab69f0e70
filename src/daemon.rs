use crate::config::load_config;
use crate::error::Result;
use crate::ipc::{socket_path, ControlMessage, SOCKET_ENV};
use crate::predictor::{PredictionOutput, Predictor};
use std::io::{self, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{env, fs};
use tracing::{debug, error, info, trace};

/// Loads both models once, then answers diagnosis requests until told to stop.
pub fn run_daemon(socket: Option<PathBuf>) -> Result<()> {
    if let Some(s) = socket {
        env::set_var(SOCKET_ENV, &s);
        debug!(socket = %s.display(), "using custom socket path");
    }
    let cfg = load_config()?;
    let predictor = Arc::new(Predictor::from_config(&cfg)?);

    let sock_path = socket_path();
    if fs::remove_file(&sock_path).is_ok() {
        trace!(path = %sock_path.display(), "removed stale socket");
    }
    let listener = UnixListener::bind(&sock_path)?;
    info!(path = %sock_path.display(), "daemon listening");
    serve(listener, predictor)?;
    let _ = fs::remove_file(&sock_path);
    info!("daemon stopped");
    Ok(())
}

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Accept loop. Each connection is decoded and answered on its own thread against
/// the shared predictor; `Shutdown` stops accepting and waits for in-flight replies.
pub fn serve(listener: UnixListener, predictor: Arc<Predictor>) -> io::Result<()> {
    let stop = AtomicBool::new(false);
    let wake_path = listener.local_addr()?.as_pathname().map(Path::to_path_buf);
    std::thread::scope(|scope| {
        for stream in listener.incoming() {
            if stop.load(Ordering::Acquire) {
                break;
            }
            let s = match stream {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to accept connection: {e}");
                    continue;
                }
            };
            let (predictor, stop, wake) = (&*predictor, &stop, wake_path.as_deref());
            scope.spawn(move || handle_connection(s, predictor, stop, wake));
        }
    });
    Ok(())
}

fn handle_connection(
    mut s: UnixStream,
    predictor: &Predictor,
    stop: &AtomicBool,
    wake: Option<&Path>,
) {
    if let Err(e) = s.set_read_timeout(Some(READ_TIMEOUT)) {
        error!("failed to set read timeout: {e}");
        return;
    }
    let msg = match serde_json::from_reader::<_, ControlMessage>(&mut s) {
        Ok(m) => m,
        Err(e) => {
            error!("failed to decode message: {e}");
            return;
        }
    };
    debug!(?msg, "received message");
    match msg {
        ControlMessage::Shutdown => {
            stop.store(true, Ordering::Release);
            // the accept loop only sees the flag once another connection arrives
            if let Some(path) = wake {
                let _ = UnixStream::connect(path);
            }
        }
        ControlMessage::Ping => {
            if let Err(e) = serde_json::to_writer(&mut s, "pong") {
                error!("failed to reply: {e}");
            }
        }
        ControlMessage::Diagnose(path) => reply_diagnosis(s, predictor, &path),
    }
}

fn reply_diagnosis(mut stream: UnixStream, predictor: &Predictor, path: &Path) {
    let output: PredictionOutput = predictor.diagnose_path(path).into();
    if let PredictionOutput::Error { error } = &output {
        error!(path = %path.display(), "diagnosis failed: {error}");
    }
    let sent = serde_json::to_writer(&mut stream, &output)
        .map_err(io::Error::from)
        .and_then(|_| stream.flush());
    if let Err(e) = sent {
        error!("failed to reply: {e}");
    }
}

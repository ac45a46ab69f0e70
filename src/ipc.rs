use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::{env, io};

pub const SOCKET_ENV: &str = "MEDSCAN_SOCKET";
const SOCKET_NAME: &str = "medscan.sock";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Diagnose(PathBuf),
    Ping,
    Shutdown,
}

pub fn socket_path() -> PathBuf {
    if let Some(path) = env::var_os(SOCKET_ENV) {
        return PathBuf::from(path);
    }
    env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir)
        .join(SOCKET_NAME)
}

/// Sends one message and returns the daemon's reply, if it sent one.
pub fn send_command(msg: &ControlMessage) -> io::Result<Option<String>> {
    let mut stream = UnixStream::connect(socket_path())?;
    serde_json::to_writer(&mut stream, msg)?;
    stream.flush()?;
    let _ = stream.shutdown(Shutdown::Write);

    let mut buf = String::new();
    stream.read_to_string(&mut buf)?;
    Ok(Some(buf).filter(|b| !b.is_empty()))
}

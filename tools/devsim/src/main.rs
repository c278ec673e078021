//! Device simulator: implements the serial wire protocol on a PTY so the
//! adapter daemon can be driven end-to-end without hardware.
//!
//! The PTY slave is symlinked to `--line`; point `mculink-mcpd` at the same
//! path. Tag 0 answers with the device id (the manifest file stem); every
//! other manifest tool answers with a stub value for its return type.

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs as unix_fs;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use mculink_manifest::{Manifest, ToolDescriptor};
use mculink_protocol::{
    decode_command, encode_error_response, encode_response, ArgEncoder, PayloadCursor,
    SlipDecoder, WireType, DEVICE_ID_TAG, DEV_ERR_CRC, DEV_ERR_DISPATCH, MAX_FRAME_LEN,
    MAX_SLIP_LEN,
};
use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname, unlockpt};
use tracing::{debug, info, warn};

/// Simulate a serial device described by a manifest.
#[derive(Parser, Debug)]
#[command(name = "mculink-devsim", version)]
struct Cli {
    /// Symlink path presented as the serial line (e.g. /tmp/ttysim).
    #[arg(long)]
    line: PathBuf,

    /// Manifest file; the device id is the file stem.
    #[arg(long)]
    manifest: PathBuf,
}

/// Removes the line symlink when the simulator exits.
struct SymlinkGuard {
    path: PathBuf,
}

impl SymlinkGuard {
    fn new(path: PathBuf, target: &Path) -> Result<Self> {
        if path.symlink_metadata().is_ok() {
            fs::remove_file(&path)
                .with_context(|| format!("remove stale symlink {}", path.display()))?;
        }
        unix_fs::symlink(target, &path)
            .with_context(|| format!("create symlink {}", path.display()))?;
        info!(line = %path.display(), pty = %target.display(), "line symlink created");
        Ok(Self { path })
    }
}

impl Drop for SymlinkGuard {
    fn drop(&mut self) {
        if self.path.symlink_metadata().is_ok() {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(error = %e, "failed to remove line symlink");
            }
        }
    }
}

struct Simulator {
    manifest: Manifest,
    device_id: String,
    pty: File,
    _symlink: SymlinkGuard,
    decoder: SlipDecoder,
}

impl Simulator {
    fn new(cli: Cli) -> Result<Self> {
        let manifest = Manifest::load(&cli.manifest)?;
        let device_id = cli
            .manifest
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("manifest path has no usable file stem"))?
            .to_string();

        info!(
            device_id = %device_id,
            name = %manifest.name,
            version = %manifest.version,
            tools = manifest.tools.len(),
            "manifest loaded"
        );
        for tool in &manifest.tools {
            info!(tag = tool.tag, signature = %tool.signature(), "tool");
        }

        // Non-blocking master so the read loop can notice shutdown.
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK)
            .context("open PTY master")?;
        grantpt(&master).context("grant PTY")?;
        unlockpt(&master).context("unlock PTY")?;
        let slave_name = unsafe { ptsname(&master) }.context("resolve PTY slave name")?;
        info!(slave = %slave_name, "PTY created");

        let symlink = SymlinkGuard::new(cli.line, Path::new(&slave_name))?;
        let pty = unsafe { File::from_raw_fd(master.into_raw_fd()) };

        Ok(Self {
            manifest,
            device_id,
            pty,
            _symlink: symlink,
            decoder: SlipDecoder::new(),
        })
    }

    fn run(&mut self, running: Arc<AtomicBool>) -> Result<()> {
        info!("simulator running, waiting for the adapter");
        let mut buffer = [0u8; 256];
        let mut connected = false;

        while running.load(Ordering::Relaxed) {
            match self.pty.read(&mut buffer) {
                Ok(0) => {
                    if connected {
                        info!("host disconnected");
                        connected = false;
                        self.decoder.reset();
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Ok(n) => {
                    if !connected {
                        info!("host connected");
                        connected = true;
                        self.decoder.reset();
                    }
                    for &byte in &buffer[..n] {
                        if let Some(frame) = self.decoder.push(byte) {
                            let response = self.handle_frame(&frame);
                            if let Err(e) = self.send_frame(&response) {
                                warn!(error = %e, "failed to send response");
                                connected = false;
                                self.decoder.reset();
                            }
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    // EIO while no slave is open; treat as disconnect.
                    if connected {
                        debug!(error = %e, "host disconnected");
                        connected = false;
                        self.decoder.reset();
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }

        info!("simulator shutting down");
        Ok(())
    }

    /// Answer one decoded command frame with a raw response frame.
    fn handle_frame(&self, frame: &[u8]) -> Vec<u8> {
        let (tag, args) = match decode_command(frame) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(?e, "rejecting command frame");
                return error_frame(DEV_ERR_CRC);
            }
        };

        if tag == DEVICE_ID_TAG {
            info!("deviceId() -> \"{}\"", self.device_id);
            return match cstr_frame(&self.device_id) {
                Ok(frame) => frame,
                Err(_) => error_frame(DEV_ERR_CRC),
            };
        }

        let Some(tool) = self.manifest.by_tag(tag) else {
            warn!(tag, "unknown command tag");
            return error_frame(DEV_ERR_DISPATCH);
        };

        match self.stub_response(tool, args) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(tool = %tool.name, ?e, "malformed arguments");
                error_frame(DEV_ERR_CRC)
            }
        }
    }

    fn stub_response(
        &self,
        tool: &ToolDescriptor,
        args: &[u8],
    ) -> Result<Vec<u8>, mculink_protocol::Error> {
        // Walk the declared parameters both to validate the encoding and to
        // log the call the way firmware would dispatch it.
        let mut cursor = PayloadCursor::new(args);
        let mut rendered = Vec::with_capacity(tool.params.len());
        for param in &tool.params {
            let value = match param.ty {
                WireType::I16 => cursor.read_i16()?.to_string(),
                WireType::I32 => cursor.read_i32()?.to_string(),
                WireType::CStr => format!("{:?}", cursor.read_cstr()?),
            };
            rendered.push(format!("{}={value}", param.name));
        }
        cursor.finish()?;

        let ret = tool.return_type.map(WireType::name).unwrap_or("void");
        info!("{}({}) -> {} stub", tool.name, rendered.join(", "), ret);

        let mut payload = ArgEncoder::new();
        match tool.return_type {
            None => {}
            Some(WireType::I16) => payload.write_i16(0)?,
            Some(WireType::I32) => payload.write_i32(0)?,
            Some(WireType::CStr) => payload.write_cstr("")?,
        }
        let mut out = [0u8; MAX_FRAME_LEN];
        let n = encode_response(payload.as_bytes(), &mut out)?;
        Ok(out[..n].to_vec())
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let mut encoded = [0u8; MAX_SLIP_LEN];
        let n = mculink_protocol::slip_encode(frame, &mut encoded)
            .map_err(|e| anyhow!("SLIP encode failed: {e:?}"))?;
        self.pty.write_all(&encoded[..n])?;
        debug!(bytes = n, "response sent");
        Ok(())
    }
}

fn error_frame(code: u8) -> Vec<u8> {
    let mut out = [0u8; 4];
    // Cannot fail: the buffer fits the fixed three-byte error frame.
    let n = encode_error_response(code, &mut out).unwrap_or(3);
    out[..n].to_vec()
}

fn cstr_frame(value: &str) -> Result<Vec<u8>, mculink_protocol::Error> {
    let mut payload = ArgEncoder::new();
    payload.write_cstr(value)?;
    let mut out = [0u8; MAX_FRAME_LEN];
    let n = encode_response(payload.as_bytes(), &mut out)?;
    Ok(out[..n].to_vec())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    if !cli.manifest.exists() {
        return Err(anyhow!(
            "manifest file does not exist: {}",
            cli.manifest.display()
        ));
    }

    let mut simulator = Simulator::new(cli)?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_running = running.clone();
    ctrlc::set_handler(move || {
        info!("interrupt received, shutting down");
        handler_running.store(false, Ordering::Relaxed);
    })
    .context("install interrupt handler")?;

    simulator.run(running)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulator_for_tests() -> Simulator {
        let dir = tempfile_dir();
        let manifest_path = dir.join("test-robot.json");
        fs::write(
            &manifest_path,
            r#"{
                "name": "Test Robot",
                "description": "fixture",
                "version": "1.0.0",
                "functions": [
                    { "tag": 1, "name": "blinkLED", "desc": "", "return": null,
                      "params": [ { "name": "n", "type": "i16" } ] },
                    { "tag": 2, "name": "getTemperature", "desc": "", "return": "i16",
                      "params": [] }
                ]
            }"#,
        )
        .unwrap();
        Simulator::new(Cli {
            line: dir.join("ttysim"),
            manifest: manifest_path,
        })
        .unwrap()
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mculink-devsim-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn command_frame(tag: u8, args: &[u8]) -> Vec<u8> {
        let mut out = [0u8; MAX_FRAME_LEN];
        let n = mculink_protocol::encode_command(tag, args, &mut out).unwrap();
        out[..n].to_vec()
    }

    #[test]
    fn device_id_command_answers_with_manifest_stem() {
        let sim = simulator_for_tests();
        let response = sim.handle_frame(&command_frame(DEVICE_ID_TAG, &[]));
        let payload = mculink_protocol::decode_response(&response).unwrap();
        let mut cursor = PayloadCursor::new(payload);
        assert_eq!(cursor.read_cstr().unwrap(), "test-robot");
    }

    #[test]
    fn void_tool_answers_bare_crc() {
        let sim = simulator_for_tests();
        let response = sim.handle_frame(&command_frame(1, &[0x05, 0x00]));
        assert_eq!(response, vec![0x00]);
    }

    #[test]
    fn typed_tool_answers_zero_stub() {
        let sim = simulator_for_tests();
        let response = sim.handle_frame(&command_frame(2, &[]));
        let payload = mculink_protocol::decode_response(&response).unwrap();
        let mut cursor = PayloadCursor::new(payload);
        assert_eq!(cursor.read_i16().unwrap(), 0);
    }

    #[test]
    fn unknown_tag_answers_dispatch_error() {
        let sim = simulator_for_tests();
        let response = sim.handle_frame(&command_frame(9, &[]));
        assert_eq!(
            mculink_protocol::decode_response(&response),
            Err(mculink_protocol::Error::Device(DEV_ERR_DISPATCH))
        );
    }

    #[test]
    fn corrupt_command_answers_crc_error() {
        let sim = simulator_for_tests();
        let mut frame = command_frame(1, &[0x05, 0x00]);
        *frame.last_mut().unwrap() ^= 0xFF;
        let response = sim.handle_frame(&frame);
        assert_eq!(
            mculink_protocol::decode_response(&response),
            Err(mculink_protocol::Error::Device(DEV_ERR_CRC))
        );
    }

    #[test]
    fn malformed_arguments_answer_crc_error() {
        let sim = simulator_for_tests();
        // blinkLED expects two argument bytes; send one.
        let response = sim.handle_frame(&command_frame(1, &[0x05]));
        assert_eq!(
            mculink_protocol::decode_response(&response),
            Err(mculink_protocol::Error::Device(DEV_ERR_CRC))
        );
    }
}

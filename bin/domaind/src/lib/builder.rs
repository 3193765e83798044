// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The line protocol spoken with the short-lived domain builder helper,
//! and the framing of suspend images.
//!
//! The helper is spawned per operation (build, save, restore). It reports
//! `debug` and `progress` frames while working, `suspend` when the guest
//! must be told to suspend, and exactly one terminal `result` or `error`
//! frame. The daemon writes `done\n` to the helper's stdin to let a save
//! proceed after the guest has shut down.
//!
//! A suspend image is `XenSavedDomain\n`, the helper's opaque payload,
//! and (for HVM guests) one `QemuDeviceModelRecord\n`-framed device-model
//! blob: magic, 4-byte big-endian length, then that many bytes.

use std::os::fd::IntoRawFd;
use std::path::PathBuf;
use std::process::Stdio;

use domaind_api_types::{DomId, Error};
use slog::{debug, info, Logger};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
    BufReader, Lines,
};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::tasks::Task;

pub const SAVE_SIGNATURE: &[u8] = b"XenSavedDomain\n";
pub const DM_RECORD_MAGIC: &[u8] = b"QemuDeviceModelRecord\n";

/// Upper bound on a device-model record; anything larger is a corrupt
/// image.
const DM_RECORD_MAX: u32 = 256 * 1024 * 1024;

/// The operation the helper is asked to perform; doubles as its `-mode`
/// argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelperMode {
    Build,
    HvmBuild,
    Save,
    HvmSave,
    Restore,
    HvmRestore,
}

impl HelperMode {
    pub fn arg(&self) -> &'static str {
        match self {
            HelperMode::Build => "build",
            HelperMode::HvmBuild => "hvm_build",
            HelperMode::Save => "save",
            HelperMode::HvmSave => "hvm_save",
            HelperMode::Restore => "restore",
            HelperMode::HvmRestore => "hvm_restore",
        }
    }
}

/// Everything needed to spawn one helper.
pub struct HelperInvocation {
    pub helper_path: PathBuf,
    pub mode: HelperMode,
    pub domid: DomId,
    /// `-key value` argument pairs (kernel path, memory bounds, ...).
    pub args: Vec<(String, String)>,
    /// For save/restore: the image file, donated to the child as fd 3.
    pub image: Option<std::fs::File>,
}

/// One frame read from the helper.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Debug(String),
    Progress(u8),
    Suspend,
    Result(Vec<String>),
    Error(String),
}

/// Parses one helper line. Progress frames arrive with a short
/// `\x08\x08\x08\x08` prefix used to redraw a terminal; it is stripped
/// before the percentage is read.
pub fn parse_frame(line: &str) -> Result<Frame, Error> {
    let line = line.trim_end();
    if line == "suspend" {
        return Ok(Frame::Suspend);
    }
    let (kind, rest) = line.split_once(' ').unwrap_or((line, ""));
    match kind {
        "debug" => Ok(Frame::Debug(rest.to_owned())),
        "progress" => {
            let pct = rest.trim_start_matches('\x08').trim();
            let value: i64 = pct.parse().map_err(|_| {
                Error::HelperProtocol(format!("bad progress frame: {line:?}"))
            })?;
            Ok(Frame::Progress(value.clamp(0, 100) as u8))
        }
        "result" => Ok(Frame::Result(
            rest.split_whitespace().map(str::to_owned).collect(),
        )),
        "error" => Ok(Frame::Error(rest.to_owned())),
        _ => Err(Error::HelperProtocol(format!("unknown frame: {line:?}"))),
    }
}

/// The tokens of a successful build: the store and console ring frame
/// numbers plus the guest's ABI protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildOutput {
    pub store_mfn: u64,
    pub console_mfn: u64,
    pub protocol: String,
}

pub fn parse_build_result(words: &[String]) -> Result<BuildOutput, Error> {
    if words.len() != 3 {
        return Err(Error::HelperProtocol(format!(
            "expected 3 build result tokens, got {}",
            words.len()
        )));
    }
    Ok(BuildOutput {
        store_mfn: parse_mfn(&words[0])?,
        console_mfn: parse_mfn(&words[1])?,
        protocol: words[2].clone(),
    })
}

/// A restore reports only the two ring frame numbers.
pub fn parse_restore_result(words: &[String]) -> Result<(u64, u64), Error> {
    if words.len() != 2 {
        return Err(Error::HelperProtocol(format!(
            "expected 2 restore result tokens, got {}",
            words.len()
        )));
    }
    Ok((parse_mfn(&words[0])?, parse_mfn(&words[1])?))
}

fn parse_mfn(s: &str) -> Result<u64, Error> {
    s.parse()
        .map_err(|_| Error::HelperProtocol(format!("bad frame number: {s:?}")))
}

/// A running helper process. Frames are consumed through
/// [`HelperSession::next_event`]; debug and progress frames are absorbed
/// there (logged and forwarded to the task) so callers only see the
/// control-flow events.
pub struct HelperSession {
    child: Child,
    data: Lines<BufReader<ChildStdout>>,
    dbg: Lines<BufReader<ChildStderr>>,
    data_eof: bool,
    dbg_eof: bool,
    stdin: Option<ChildStdin>,
    task: Task,
    log: Logger,
}

/// The events a caller must act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HelperEvent {
    /// The helper is ready for the guest to be told to suspend.
    Suspend,
    /// Terminal success with the result tokens.
    Done(Vec<String>),
}

impl HelperSession {
    pub fn spawn(
        inv: HelperInvocation,
        task: Task,
        log: Logger,
    ) -> Result<Self, Error> {
        let mut cmd = Command::new(&inv.helper_path);
        cmd.arg("-mode")
            .arg(inv.mode.arg())
            .arg("-domid")
            .arg(inv.domid.to_string());
        for (k, v) in &inv.args {
            cmd.arg(format!("-{k}")).arg(v);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // The image file is donated as fd 3. Everything else the daemon
        // holds is close-on-exec, so the child sees exactly its three
        // pipes and (maybe) the image.
        let donated = inv.image.map(|f| f.into_raw_fd());
        if let Some(raw) = donated {
            cmd.arg("-image-fd").arg("3");
            unsafe {
                cmd.pre_exec(move || {
                    if libc::dup2(raw, 3) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::InternalError(format!(
                "cannot spawn helper {}: {}",
                inv.helper_path.display(),
                e
            ))
        })?;

        // The parent's copy of the donated fd is no longer needed.
        if let Some(raw) = donated {
            unsafe {
                libc::close(raw);
            }
        }

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let stdin = child.stdin.take().expect("stdin piped");
        info!(log, "spawned builder helper";
              "mode" => inv.mode.arg(), "domid" => inv.domid);
        Ok(Self {
            child,
            data: BufReader::new(stdout).lines(),
            dbg: BufReader::new(stderr).lines(),
            data_eof: false,
            dbg_eof: false,
            stdin: Some(stdin),
            task,
            log,
        })
    }

    /// Reads frames until one requires the caller's attention. An `error`
    /// frame surfaces as [`Error::HelperReported`]; EOF on both channels
    /// with no terminal frame is a protocol violation.
    pub async fn next_event(&mut self) -> Result<HelperEvent, Error> {
        loop {
            self.task.check_cancel()?;
            let line = match (self.data_eof, self.dbg_eof) {
                (true, true) => {
                    return Err(Error::HelperProtocol(
                        "helper exited without a terminal frame".into(),
                    ));
                }
                (true, false) => self.dbg.next_line().await,
                (false, true) => self.data.next_line().await,
                (false, false) => tokio::select! {
                    l = self.data.next_line() => {
                        if matches!(l, Ok(None)) {
                            self.data_eof = true;
                            continue;
                        }
                        l
                    }
                    l = self.dbg.next_line() => {
                        if matches!(l, Ok(None)) {
                            self.dbg_eof = true;
                            continue;
                        }
                        l
                    }
                },
            };
            let line = match line {
                Ok(Some(l)) => l,
                Ok(None) => {
                    self.data_eof = true;
                    self.dbg_eof = true;
                    continue;
                }
                Err(e) => return Err(Error::from(e)),
            };
            if line.is_empty() {
                continue;
            }
            match parse_frame(&line)? {
                Frame::Debug(text) => {
                    debug!(self.log, "helper: {}", text);
                }
                Frame::Progress(pct) => {
                    self.task.set_progress(pct);
                }
                Frame::Suspend => return Ok(HelperEvent::Suspend),
                Frame::Result(words) => return Ok(HelperEvent::Done(words)),
                Frame::Error(text) => {
                    return Err(Error::HelperReported(text));
                }
            }
        }
    }

    /// Tells a saving helper that the guest has shut down and the final
    /// memory copy may proceed.
    pub async fn send_done(&mut self) -> Result<(), Error> {
        let stdin =
            self.stdin.as_mut().ok_or_else(|| {
                Error::HelperProtocol("helper stdin closed".into())
            })?;
        stdin.write_all(b"done\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Reaps the helper after its terminal frame.
    pub async fn finish(mut self) -> Result<(), Error> {
        drop(self.stdin.take());
        let status = self.child.wait().await?;
        if !status.success() {
            return Err(Error::HelperProtocol(format!(
                "helper exited with {status}"
            )));
        }
        Ok(())
    }
}

/// Writes the suspend-image signature. Done by the engine before the
/// saving helper ever touches the file.
pub async fn write_save_signature<W: AsyncWrite + Unpin>(
    w: &mut W,
) -> Result<(), Error> {
    w.write_all(SAVE_SIGNATURE).await?;
    Ok(())
}

/// Verifies the suspend-image signature at the start of a restore.
pub async fn check_save_signature<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(), Error> {
    let mut buf = vec![0u8; SAVE_SIGNATURE.len()];
    r.read_exact(&mut buf).await.map_err(|_| Error::BadSignature)?;
    if buf != SAVE_SIGNATURE {
        return Err(Error::BadSignature);
    }
    Ok(())
}

/// Appends a framed device-model record to a suspend image.
pub async fn write_dm_record<W: AsyncWrite + Unpin>(
    w: &mut W,
    blob: &[u8],
) -> Result<(), Error> {
    w.write_all(DM_RECORD_MAGIC).await?;
    w.write_all(&(blob.len() as u32).to_be_bytes()).await?;
    w.write_all(blob).await?;
    Ok(())
}

/// Reads a framed device-model record from a suspend image.
pub async fn read_dm_record<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Vec<u8>, Error> {
    let mut magic = vec![0u8; DM_RECORD_MAGIC.len()];
    r.read_exact(&mut magic).await.map_err(|_| Error::BadSignature)?;
    if magic != DM_RECORD_MAGIC {
        return Err(Error::BadSignature);
    }
    let mut len = [0u8; 4];
    r.read_exact(&mut len).await.map_err(|_| Error::TruncatedDmState)?;
    let len = u32::from_be_bytes(len);
    if len > DM_RECORD_MAX {
        return Err(Error::TruncatedDmState);
    }
    let mut blob = vec![0u8; len as usize];
    r.read_exact(&mut blob).await.map_err(|_| Error::TruncatedDmState)?;
    Ok(blob)
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::o;
    use std::io::Cursor;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn frames_parse() {
        assert_eq!(
            parse_frame("debug mapping p2m").unwrap(),
            Frame::Debug("mapping p2m".into())
        );
        assert_eq!(
            parse_frame("progress \x08\x08\x08\x0842").unwrap(),
            Frame::Progress(42)
        );
        assert_eq!(parse_frame("progress 250").unwrap(), Frame::Progress(100));
        assert_eq!(parse_frame("suspend").unwrap(), Frame::Suspend);
        assert_eq!(
            parse_frame("result 1234 5678 x86_64-abi").unwrap(),
            Frame::Result(vec![
                "1234".into(),
                "5678".into(),
                "x86_64-abi".into()
            ])
        );
        assert!(matches!(
            parse_frame("error out of memory").unwrap(),
            Frame::Error(t) if t == "out of memory"
        ));
        assert!(matches!(
            parse_frame("bogus line"),
            Err(Error::HelperProtocol(_))
        ));
        assert!(matches!(
            parse_frame("progress not-a-number"),
            Err(Error::HelperProtocol(_))
        ));
    }

    #[test]
    fn build_results_need_exactly_three_tokens() {
        let out = parse_build_result(&[
            "100".to_string(),
            "200".to_string(),
            "x86_32-abi".to_string(),
        ])
        .unwrap();
        assert_eq!(out.store_mfn, 100);
        assert_eq!(out.console_mfn, 200);
        assert_eq!(out.protocol, "x86_32-abi");

        assert!(parse_build_result(&["1".to_string()]).is_err());
        assert!(parse_restore_result(&[
            "1".to_string(),
            "2".to_string(),
            "3".to_string()
        ])
        .is_err());
    }

    #[tokio::test]
    async fn dm_records_frame_and_unframe() {
        let mut img = Cursor::new(Vec::new());
        write_save_signature(&mut img).await.unwrap();
        write_dm_record(&mut img, b"qemu state bytes").await.unwrap();

        let mut rd = Cursor::new(img.into_inner());
        check_save_signature(&mut rd).await.unwrap();
        let blob = read_dm_record(&mut rd).await.unwrap();
        assert_eq!(blob, b"qemu state bytes");
    }

    #[tokio::test]
    async fn bad_signature_and_truncation_are_distinguished() {
        let mut rd = Cursor::new(b"NotASavedDomain\n".to_vec());
        assert!(matches!(
            check_save_signature(&mut rd).await,
            Err(Error::BadSignature)
        ));

        // A record whose magic is fine but whose payload is short.
        let mut img = Cursor::new(Vec::new());
        img.get_mut().extend_from_slice(DM_RECORD_MAGIC);
        img.get_mut().extend_from_slice(&100u32.to_be_bytes());
        img.get_mut().extend_from_slice(b"short");
        let mut rd = Cursor::new(img.into_inner());
        assert!(matches!(
            read_dm_record(&mut rd).await,
            Err(Error::TruncatedDmState)
        ));
    }

    #[tokio::test]
    async fn helper_session_streams_progress_and_result() {
        use std::os::unix::fs::PermissionsExt;

        // A stand-in helper: emits progress on stderr (the debug channel)
        // and the result on stdout, ignoring its arguments.
        let dir = tempfile::tempdir().unwrap();
        let helper = dir.path().join("fake-helper");
        std::fs::write(
            &helper,
            "#!/bin/sh\n\
             echo 'progress 50' >&2\n\
             echo 'debug building' >&2\n\
             echo 'result 77 88 x86_64-abi'\n",
        )
        .unwrap();
        std::fs::set_permissions(
            &helper,
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();

        let task = Task::new();
        let mut session = HelperSession::spawn(
            HelperInvocation {
                helper_path: helper,
                mode: HelperMode::Build,
                domid: 1,
                args: Vec::new(),
                image: None,
            },
            task.clone(),
            test_logger(),
        )
        .unwrap();

        let ev = session.next_event().await.unwrap();
        let HelperEvent::Done(words) = ev else {
            panic!("expected terminal result, got {ev:?}");
        };
        let out = parse_build_result(&words).unwrap();
        assert_eq!((out.store_mfn, out.console_mfn), (77, 88));
        assert_eq!(task.progress(), 50);
        session.finish().await.unwrap();
    }
}

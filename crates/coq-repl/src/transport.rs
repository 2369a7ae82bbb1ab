use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::protocol::{decode_text, normalize_wire_entities};
use crate::types::CoqError;
use crate::xml::{self, Element};

/// Bytes requested per read from the backend.
const CHUNK_SIZE: usize = 0x4000;

/// How long `terminate` waits after SIGTERM before killing outright.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A complete reply read from the backend.
#[derive(Debug, Clone)]
pub struct RawReply {
    /// The `<value>` element that ended the message.
    pub value: Element,
    /// Text of the last message or feedback notification seen before it.
    pub annotation: Option<String>,
}

/// Why [`MessageReader::read_message`] returned without a reply.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The overall deadline passed; the backend may still answer later.
    #[error("deadline passed before a reply arrived")]
    Timeout,
    /// Nothing became readable within the readiness timeout, or the stream
    /// closed.
    #[error("backend stopped responding")]
    Died,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Assembles protocol messages from an unframed byte stream.
///
/// The stream is a sequence of sibling elements: any number of `feedback`
/// and `message` notifications followed by the `value` that answers the
/// pending call. Bytes past a returned `value` stay buffered for the next
/// read, and replies owed to reads that timed out are skipped when they
/// finally arrive.
pub struct MessageReader<R> {
    reader: R,
    buffer: Vec<u8>,
    chunk: Box<[u8]>,
    /// Text of the last notification since the previous reply.
    annotation: Option<String>,
    /// Replies still owed to timed-out reads.
    abandoned: usize,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            chunk: vec![0; CHUNK_SIZE].into_boxed_slice(),
            annotation: None,
            abandoned: 0,
        }
    }

    /// Read until the `<value>` answering the latest call has been received.
    ///
    /// Each wait for data is bounded by `readiness`; running out of it means
    /// the backend is considered dead. `deadline`, if set, bounds the whole
    /// read and is checked before every wait. After a timeout the reply is
    /// still owed: it is discarded when it shows up, unless
    /// [`MessageReader::resume`] claims it first.
    pub async fn read_message(
        &mut self,
        readiness: Duration,
        deadline: Option<Instant>,
    ) -> Result<RawReply, ReadError> {
        if self.abandoned == 0 {
            self.drop_leftover_notifications();
        }
        loop {
            while let Some(reply) = self.next_reply() {
                if self.abandoned == 0 {
                    return Ok(reply);
                }
                self.abandoned -= 1;
                tracing::debug!(remaining = self.abandoned, "Discarded late reply");
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.abandoned += 1;
                return Err(ReadError::Timeout);
            }

            let n = match tokio::time::timeout(readiness, self.reader.read(&mut self.chunk)).await {
                Err(_) => return Err(ReadError::Died),
                Ok(Ok(0)) => return Err(ReadError::Died),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(ReadError::Io(e)),
            };
            self.buffer.extend_from_slice(&self.chunk[..n]);
            self.buffer = normalize_wire_entities(&self.buffer);
        }
    }

    /// Keep waiting for the reply to the most recent read that timed out.
    pub async fn resume(
        &mut self,
        readiness: Duration,
        deadline: Option<Instant>,
    ) -> Result<RawReply, ReadError> {
        self.abandoned = self.abandoned.saturating_sub(1);
        self.read_message(readiness, deadline).await
    }

    /// Number of timed-out reads whose replies have not arrived yet.
    pub fn abandoned(&self) -> usize {
        self.abandoned
    }

    /// Consume buffered elements up to and including the first `value`.
    ///
    /// Notifications before it become the reply's annotation. An incomplete
    /// tail is left in the buffer.
    fn next_reply(&mut self) -> Option<RawReply> {
        let parseable = repair_utf8(&mut self.buffer);
        let parsed = xml::parse_stream(&String::from_utf8_lossy(&self.buffer[..parseable]));

        let mut consumed = 0;
        let mut reply = None;
        for (element, end) in parsed {
            consumed = end;
            if element.name == "value" {
                reply = Some(RawReply {
                    value: element,
                    annotation: self.annotation.take(),
                });
                break;
            }
            if let Some(text) = notification_text(&element) {
                self.annotation = Some(text);
            }
        }
        self.buffer.drain(..consumed);
        reply
    }

    /// Forget notifications the previous reply left behind; they are not
    /// about the call being read now.
    fn drop_leftover_notifications(&mut self) {
        let parseable = repair_utf8(&mut self.buffer);
        let parsed = xml::parse_stream(&String::from_utf8_lossy(&self.buffer[..parseable]));
        let consumed = parsed
            .iter()
            .take_while(|(element, _)| element.name != "value")
            .last()
            .map_or(0, |(_, end)| *end);
        self.buffer.drain(..consumed);
        self.annotation = None;
    }
}

/// Replace invalid UTF-8 sequences in place and return the length of the
/// prefix that can be decoded now. A truncated character at the end is left
/// for the next read to complete.
fn repair_utf8(buffer: &mut Vec<u8>) -> usize {
    loop {
        match std::str::from_utf8(buffer) {
            Ok(_) => return buffer.len(),
            Err(e) => match e.error_len() {
                None => return e.valid_up_to(),
                Some(len) => {
                    let start = e.valid_up_to();
                    let tail = buffer.split_off(start + len);
                    buffer.truncate(start);
                    buffer.extend_from_slice("\u{FFFD}".as_bytes());
                    buffer.extend_from_slice(&tail);
                }
            },
        }
    }
}

/// Display text carried by a `feedback` or `message` notification.
fn notification_text(element: &Element) -> Option<String> {
    match element.name.as_str() {
        "feedback" => {
            let content = element.elements().find(|c| c.val() == Some("message"))?;
            content.elements().filter_map(message_text).last()
        }
        "message" => message_text(element),
        _ => None,
    }
}

/// Display text of a `<message>`: its last child is the payload, after the
/// level and (on newer backends) the location.
fn message_text(message: &Element) -> Option<String> {
    let payload = message.elements().last()?;
    Some(decode_text(&payload.inner_xml()))
}

/// A running backend process and its pipes.
///
/// All I/O goes through [`CoqProcess::send`] and
/// [`CoqProcess::read_message`]; the session owns the process exclusively.
pub struct CoqProcess {
    child: Option<Child>,
    stdin: Option<BufWriter<BoxedWriter>>,
    reader: MessageReader<BoxedReader>,
}

impl CoqProcess {
    /// Start `executable` with `args`, stdin and stdout piped.
    ///
    /// On Unix stderr shares the stdout pipe and the child ignores SIGINT, so
    /// a Ctrl-C aimed at the client does not take the backend down with it.
    pub fn spawn(
        executable: &Path,
        args: &[String],
        working_dir: Option<&Path>,
    ) -> Result<Self, CoqError> {
        let mut cmd = Command::new(executable);
        cmd.args(args);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let launch_err =
            |e: std::io::Error| CoqError::Launch(format!("{}: {e}", executable.display()));

        #[cfg(unix)]
        let stdout: BoxedReader = {
            let (reader, writer) = std::io::pipe().map_err(launch_err)?;
            cmd.stdout(writer.try_clone().map_err(launch_err)?)
                .stderr(writer);
            ignore_sigint(&mut cmd);
            let fd: std::os::fd::OwnedFd = reader.into();
            Box::pin(tokio::net::unix::pipe::Receiver::from_owned_fd(fd).map_err(launch_err)?)
        };

        // Without an async pipe to share with stdout, stderr is discarded so
        // an unread pipe cannot fill up and stall the child.
        #[cfg(not(unix))]
        cmd.stdout(Stdio::piped()).stderr(Stdio::null());

        let mut child = cmd
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_err)?;
        // Drop our copies of the pipe's write end so EOF is seen when the
        // child exits.
        drop(cmd);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoqError::Launch("failed to capture stdin".into()))?;

        #[cfg(not(unix))]
        let stdout: BoxedReader = Box::pin(
            child
                .stdout
                .take()
                .ok_or_else(|| CoqError::Launch("failed to capture stdout".into()))?,
        );

        tracing::debug!(
            executable = %executable.display(),
            ?args,
            pid = ?child.id(),
            "Spawned coqtop"
        );

        Ok(Self {
            child: Some(child),
            stdin: Some(BufWriter::new(Box::pin(stdin) as BoxedWriter)),
            reader: MessageReader::new(stdout),
        })
    }

    /// Wrap an already-connected pair of pipes with no child process.
    ///
    /// `terminate` closes the write side; nothing is killed.
    pub fn from_pipes<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + 'static,
        R: AsyncRead + Send + 'static,
    {
        Self {
            child: None,
            stdin: Some(BufWriter::new(Box::pin(writer) as BoxedWriter)),
            reader: MessageReader::new(Box::pin(reader) as BoxedReader),
        }
    }

    /// Whether the process has not been terminated.
    pub fn is_running(&self) -> bool {
        self.stdin.is_some()
    }

    /// Write one serialized call and flush it.
    pub async fn send(&mut self, message: &[u8]) -> Result<(), CoqError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            CoqError::Transport(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "coqtop is not running",
            ))
        })?;
        stdin.write_all(message).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// See [`MessageReader::read_message`].
    pub async fn read_message(
        &mut self,
        readiness: Duration,
        deadline: Option<Instant>,
    ) -> Result<RawReply, ReadError> {
        if self.stdin.is_none() {
            return Err(ReadError::Died);
        }
        self.reader.read_message(readiness, deadline).await
    }

    /// See [`MessageReader::resume`].
    pub async fn resume_message(
        &mut self,
        readiness: Duration,
        deadline: Option<Instant>,
    ) -> Result<RawReply, ReadError> {
        if self.stdin.is_none() {
            return Err(ReadError::Died);
        }
        self.reader.resume(readiness, deadline).await
    }

    /// Stop the backend. Errors are swallowed; calling this again, or on a
    /// process that already exited, does nothing.
    pub async fn terminate(&mut self) {
        // Closing stdin alone makes a well-behaved backend exit.
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.id();
        request_stop(&mut child);

        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(?pid, "coqtop ignored SIGTERM, killing");
                let _ = child.kill().await;
            }
        }
        tracing::debug!(?pid, "coqtop terminated");
    }
}

/// Ask the child to exit: SIGTERM on Unix, a hard kill elsewhere.
#[cfg(unix)]
fn request_stop(child: &mut Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return; // Already reaped
    };
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        if e != nix::errno::Errno::ESRCH {
            tracing::warn!(pid, error = ?e, "SIGTERM to coqtop failed");
        }
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn ignore_sigint(cmd: &mut Command) {
    use nix::sys::signal::{signal, SigHandler, Signal};

    // SAFETY: runs in the forked child before exec; sigaction is
    // async-signal-safe and nothing else is touched.
    unsafe {
        cmd.pre_exec(|| {
            signal(Signal::SIGINT, SigHandler::SigIgn)
                .map(|_| ())
                .map_err(std::io::Error::from)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Yields one scripted chunk per read, then stays pending forever.
    struct Chunks(VecDeque<Vec<u8>>);

    impl Chunks {
        fn new(chunks: &[&str]) -> Self {
            Self(chunks.iter().map(|c| c.as_bytes().to_vec()).collect())
        }
    }

    impl AsyncRead for Chunks {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            match self.0.pop_front() {
                Some(chunk) => {
                    buf.put_slice(&chunk);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Pending,
            }
        }
    }

    const READY: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn assembles_split_message() {
        let mut reader = MessageReader::new(Chunks::new(&[
            "<value va",
            r#"l="good"><state_id val="#,
            r#""7"/></value>"#,
        ]));
        let reply = reader.read_message(READY, None).await.unwrap();
        assert_eq!(reply.value.val(), Some("good"));
        assert_eq!(reply.value.first_element().unwrap().val(), Some("7"));
        assert!(reply.annotation.is_none());
    }

    #[tokio::test]
    async fn siblings_in_one_chunk_keep_last_annotation() {
        let chunk = concat!(
            r#"<feedback object="state" route="0"><state_id val="1"/>"#,
            r#"<feedback_content val="message"><message><message_level val="notice"/><option val="none"/><richpp><_>first</_></richpp></message></feedback_content></feedback>"#,
            r#"<feedback object="state" route="0"><state_id val="1"/>"#,
            r#"<feedback_content val="message"><message><message_level val="notice"/><option val="none"/><richpp><_>second</_></richpp></message></feedback_content></feedback>"#,
            r#"<feedback object="state" route="0"><state_id val="1"/><feedback_content val="processed"/></feedback>"#,
            r#"<value val="good"><unit/></value>"#,
        );
        let mut reader = MessageReader::new(Chunks::new(&[chunk]));
        let reply = reader.read_message(READY, None).await.unwrap();
        assert_eq!(reply.annotation.as_deref(), Some("second\n"));
        assert_eq!(reply.value.first_element().unwrap().name, "unit");
    }

    #[tokio::test]
    async fn legacy_message_element_is_an_annotation() {
        let mut reader = MessageReader::new(Chunks::new(&[
            r#"<message><message_level val="info"/><string>hello &amp; bye</string></message>"#,
            r#"<value val="good"><unit/></value>"#,
        ]));
        let reply = reader.read_message(READY, None).await.unwrap();
        assert_eq!(reply.annotation.as_deref(), Some("hello & bye"));
    }

    #[tokio::test]
    async fn notifications_without_value_keep_waiting() {
        let mut reader = MessageReader::new(Chunks::new(&[
            r#"<feedback object="state" route="0"><state_id val="1"/><feedback_content val="processingin"><string>master</string></feedback_content></feedback>"#,
            r#"<feedback object="state" route="0"><state_id val="1"/><feedback_content val="processed"/></feedback>"#,
            r#"<value val="fail"><state_id val="1"/><richpp>oops</richpp></value>"#,
        ]));
        let reply = reader.read_message(READY, None).await.unwrap();
        assert_eq!(reply.value.val(), Some("fail"));
    }

    #[tokio::test]
    async fn wire_entities_normalized_across_chunks() {
        let mut reader = MessageReader::new(Chunks::new(&[
            r#"<value val="good"><string>a&nb"#,
            r#"sp;b&#40;c&#41;</string></value>"#,
        ]));
        let reply = reader.read_message(READY, None).await.unwrap();
        assert_eq!(reply.value.first_element().unwrap().own_text(), "a b(c)");
    }

    #[tokio::test]
    async fn silence_means_died() {
        let mut reader = MessageReader::new(Chunks::new(&[r#"<value val="good">"#]));
        let err = reader
            .read_message(Duration::from_millis(50), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::Died));
    }

    #[tokio::test]
    async fn end_of_stream_means_died() {
        let mut reader = MessageReader::new(&b"<feedback/>"[..]);
        let err = reader.read_message(READY, None).await.unwrap_err();
        assert!(matches!(err, ReadError::Died));
    }

    #[tokio::test]
    async fn expired_deadline_is_timeout() {
        let mut reader = MessageReader::new(Chunks::new(&[r#"<value val="good"><unit/></value>"#]));
        let past = Instant::now() - Duration::from_millis(1);
        let err = reader.read_message(READY, Some(past)).await.unwrap_err();
        assert!(matches!(err, ReadError::Timeout));
    }

    #[tokio::test]
    async fn sibling_values_are_kept_for_next_read() {
        let mut reader = MessageReader::new(Chunks::new(&[concat!(
            r#"<value val="good"><string>one</string></value>"#,
            r#"<value val="good"><string>t"#,
        ), r#"wo</string></value>"#]));
        let first = reader.read_message(READY, None).await.unwrap();
        assert_eq!(first.value.first_element().unwrap().own_text(), "one");
        let second = reader.read_message(READY, None).await.unwrap();
        assert_eq!(second.value.first_element().unwrap().own_text(), "two");
    }

    #[tokio::test]
    async fn leftover_notifications_do_not_annotate_next_reply() {
        let mut reader = MessageReader::new(Chunks::new(&[
            concat!(
                r#"<value val="good"><unit/></value>"#,
                r#"<message><message_level val="info"/><string>late</string></message>"#,
            ),
            r#"<value val="good"><unit/></value>"#,
        ]));
        reader.read_message(READY, None).await.unwrap();
        let reply = reader.read_message(READY, None).await.unwrap();
        assert!(reply.annotation.is_none());
    }

    #[tokio::test]
    async fn reply_to_timed_out_read_is_discarded() {
        let mut reader = MessageReader::new(Chunks::new(&[
            r#"<value val="good"><string>stale</string></value>"#,
            r#"<value val="good"><string>fresh</string></value>"#,
        ]));
        let past = Instant::now() - Duration::from_millis(1);
        assert!(matches!(
            reader.read_message(READY, Some(past)).await,
            Err(ReadError::Timeout)
        ));
        assert_eq!(reader.abandoned(), 1);

        let reply = reader.read_message(READY, None).await.unwrap();
        assert_eq!(reply.value.first_element().unwrap().own_text(), "fresh");
        assert_eq!(reader.abandoned(), 0);
    }

    #[tokio::test]
    async fn resume_claims_reply_to_timed_out_read() {
        let mut reader = MessageReader::new(Chunks::new(&[
            r#"<value val="good"><string>late</string></value>"#,
        ]));
        let past = Instant::now() - Duration::from_millis(1);
        assert!(reader.read_message(READY, Some(past)).await.is_err());

        let reply = reader.resume(READY, None).await.unwrap();
        assert_eq!(reply.value.first_element().unwrap().own_text(), "late");
        assert_eq!(reader.abandoned(), 0);
    }

    #[test]
    fn invalid_utf8_is_replaced_and_split_characters_joined() {
        let mut reader = MessageReader::new(Chunks::new(&[]));
        reader.buffer = b"<value val=\"good\"><string>a\xFFb\xC3".to_vec();
        assert!(reader.next_reply().is_none());
        reader.buffer.extend_from_slice(b"\xA9</string></value>");
        let reply = reader.next_reply().unwrap();
        assert_eq!(reply.value.first_element().unwrap().own_text(), "a\u{FFFD}b\u{e9}");
        assert!(reader.buffer.is_empty());
    }

    #[tokio::test]
    async fn terminated_process_reads_as_dead() {
        let (client, _server) = tokio::io::duplex(64);
        let (read_half, write_half) = tokio::io::split(client);
        let mut process = CoqProcess::from_pipes(write_half, read_half);
        assert!(process.is_running());

        process.terminate().await;
        process.terminate().await;
        assert!(!process.is_running());
        assert!(matches!(
            process.read_message(READY, None).await,
            Err(ReadError::Died)
        ));
        assert!(matches!(
            process.send(b"<call/>").await,
            Err(CoqError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn spawn_missing_executable_is_launch_error() {
        let result = CoqProcess::spawn(Path::new("/nonexistent/coqidetop"), &[], None);
        assert!(matches!(result, Err(CoqError::Launch(_))));
    }
}

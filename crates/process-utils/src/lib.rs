//! Small process-related helpers shared across the workspace.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Default number of stderr lines kept by [`collect_tail`].
pub const DEFAULT_TAIL_LINES: usize = 20;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
///
/// The child is killed when its handle is dropped, so an abandoned
/// pipeline never leaves orphaned tools behind.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// Drain a child's stderr to EOF and return its last `max_lines` lines.
///
/// Every byte is consumed so the child never blocks on a full stderr pipe.
/// Invalid UTF-8 is replaced lossily and blank lines are skipped.
#[cfg(feature = "tokio")]
pub async fn collect_tail<R>(reader: R, max_lines: usize) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    use std::collections::VecDeque;
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut reader = BufReader::new(reader);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(max_lines.min(64));
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if text.is_empty() || max_lines == 0 {
                    continue;
                }
                if tail.len() == max_lines {
                    tail.pop_front();
                }
                tail.push_back(text.to_string());
            }
        }
    }

    tail.into_iter().collect::<Vec<_>>().join("\n")
}

#[cfg(all(test, feature = "tokio"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keeps_only_the_last_lines() {
        let input: &[u8] = b"one\ntwo\n\nthree\nfour";
        let tail = collect_tail(input, 2).await;
        assert_eq!(tail, "three\nfour");
    }

    #[tokio::test]
    async fn replaces_invalid_utf8() {
        let input: &[u8] = b"bad \xff byte\n";
        let tail = collect_tail(input, DEFAULT_TAIL_LINES).await;
        assert!(tail.starts_with("bad "));
        assert!(tail.ends_with(" byte"));
    }

    #[tokio::test]
    async fn empty_stream_yields_empty_tail() {
        let input: &[u8] = b"";
        assert!(collect_tail(input, 5).await.is_empty());
    }
}

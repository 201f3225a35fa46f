//! Remote job client.

use std::net::{TcpStream, ToSocketAddrs};

use tracing::debug;

use crate::error::Result;
use crate::ipc::NativeChannel;

use super::{END_OF_OUTPUT, RemoteFile, recv_files, send_files};

/// Everything a server sent back for one submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub output_lines: Vec<String>,
    pub exit_code: i32,
    pub files: Vec<RemoteFile>,
}

impl Submission {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Upload `files`, run the server's command and collect its results.
///
/// `on_line` sees each output line as it arrives.
pub fn submit(
    addr: impl ToSocketAddrs,
    files: &[RemoteFile],
    mut on_line: impl FnMut(&str),
) -> Result<Submission> {
    let stream = TcpStream::connect(addr)?;
    let mut channel = NativeChannel::new(stream.try_clone()?, stream);
    send_files(&mut channel, files)?;

    let mut output_lines = Vec::new();
    loop {
        let len = channel.read_int()? as u32;
        if len == END_OF_OUTPUT {
            break;
        }
        let bytes = channel.read_raw(len as usize)?;
        // Lines travel as raw bytes; invalid UTF-8 is replaced.
        let line = String::from_utf8_lossy(&bytes).into_owned();
        on_line(&line);
        output_lines.push(line);
    }
    let exit_code = channel.read_int()?;
    let files = recv_files(&mut channel)?;
    debug!(exit_code, returned = files.len(), "submission complete");

    Ok(Submission {
        output_lines,
        exit_code,
        files,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::remote::{RemoteServer, ServerConfig};

    #[test]
    fn test_submit_round_trip() {
        let config = ServerConfig::new(
            "sh",
            vec![
                "-c".to_string(),
                "cat input.txt; echo second; echo done > result.txt".to_string(),
            ],
        );
        let server = RemoteServer::bind("127.0.0.1:0", config).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = std::thread::spawn(move || server.serve_one());

        let mut streamed = Vec::new();
        let submission = submit(
            addr,
            &[RemoteFile::new("input.txt", b"first\n".to_vec())],
            |line| streamed.push(line.to_string()),
        )
        .unwrap();
        handle.join().unwrap().unwrap();

        assert!(submission.succeeded());
        assert_eq!(submission.output_lines, vec!["first", "second"]);
        assert_eq!(streamed, submission.output_lines);
        assert_eq!(submission.files, vec![RemoteFile::new("result.txt", b"done\n".to_vec())]);
    }

    #[test]
    fn test_exit_code_reported() {
        let config = ServerConfig::new("sh", vec!["-c".to_string(), "exit 3".to_string()]);
        let server = RemoteServer::bind("127.0.0.1:0", config).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = std::thread::spawn(move || server.serve_one());

        let submission = submit(addr, &[], |_| {}).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(submission.exit_code, 3);
        assert!(submission.files.is_empty());
    }

    #[test]
    fn test_non_utf8_output_still_returns_files() {
        let config = ServerConfig::new(
            "sh",
            vec![
                "-c".to_string(),
                "printf 'ok\\n\\377\\376\\n'; echo tail; echo r > result.txt".to_string(),
            ],
        );
        let server = RemoteServer::bind("127.0.0.1:0", config).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = std::thread::spawn(move || server.serve_one());

        let submission = submit(addr, &[], |_| {}).unwrap();
        handle.join().unwrap().unwrap();

        assert!(submission.succeeded());
        assert_eq!(submission.output_lines.len(), 3);
        assert_eq!(submission.output_lines[0], "ok");
        assert_eq!(submission.output_lines[1], "\u{FFFD}\u{FFFD}");
        assert_eq!(submission.output_lines[2], "tail");
        assert_eq!(submission.files, vec![RemoteFile::new("result.txt", b"r\n".to_vec())]);
    }
}

//! TCP control session to the WebSDR server.
//!
//! The protocol is line oriented ASCII: each request is a single
//! CRLF-terminated line, each response a single line starting with
//! `OK` on success, optionally followed by space-separated
//! `KEY=VALUE` pairs. One request is outstanding at a time; the
//! session mutex keeps request/response pairs atomic across threads.

use std::{
    io::{
        Read,
        Write,
    },
    net::{
        TcpStream,
        ToSocketAddrs,
    },
    time::Duration,
};

use parking_lot::Mutex;

/// Deadline for a single response.
pub const TCP_TIMEOUT: Duration = Duration::from_millis(5000);

const RESPONSE_BUFFER_SIZE: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control connection error")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for response")]
    Timeout,
    #[error("connection closed by server")]
    Closed,
    #[error("server rejected command: {reply}")]
    Rejected { reply: String },
}

/// One response line, already trimmed.
#[derive(Clone, Debug)]
pub struct Reply {
    line: String,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.line.starts_with("OK")
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    /// `KEY=VALUE` pairs after the `OK`.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.line
            .split_ascii_whitespace()
            .filter_map(|token| token.split_once('='))
    }

    pub fn int_field(&self, key: &str) -> Option<i64> {
        self.fields()
            .find(|(k, _)| *k == key)
            .and_then(|(_, v)| v.parse().ok())
    }
}

#[derive(Debug)]
pub struct ControlSession {
    stream: Mutex<TcpStream>,
}

impl ControlSession {
    /// Connect to the server's control port. Tries each resolved
    /// address in turn, like the usual getaddrinfo loop.
    pub fn connect(host: &str, port: u16) -> Result<Self, ControlError> {
        let addresses: Vec<_> = (host, port).to_socket_addrs()?.collect();
        let mut last_error = None;
        for address in addresses {
            match TcpStream::connect(address) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(TCP_TIMEOUT))?;
                    stream.set_nodelay(true)?;
                    tracing::debug!(%address, "control session connected");
                    return Ok(Self {
                        stream: Mutex::new(stream),
                    });
                }
                Err(error) => {
                    last_error = Some(error);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
            })
            .into())
    }

    /// Send one command and wait for its response line.
    pub fn transact(&self, command: &str) -> Result<Reply, ControlError> {
        let mut stream = self.stream.lock();

        stream.write_all(format!("{command}\r\n").as_bytes())?;

        let mut buffer = [0u8; RESPONSE_BUFFER_SIZE];
        let n = match stream.read(&mut buffer) {
            Ok(0) => return Err(ControlError::Closed),
            Ok(n) => n,
            Err(error)
                if error.kind() == std::io::ErrorKind::WouldBlock
                    || error.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(ControlError::Timeout);
            }
            Err(error) => return Err(error.into()),
        };

        let line = String::from_utf8_lossy(&buffer[..n])
            .trim_end_matches(['\r', '\n', ' '])
            .to_owned();
        tracing::trace!(command, reply = %line);
        Ok(Reply { line })
    }

    /// Like [`Self::transact`], but a non-`OK` reply is an error.
    pub fn expect_ok(&self, command: &str) -> Result<Reply, ControlError> {
        let reply = self.transact(command)?;
        if reply.is_ok() {
            Ok(reply)
        }
        else {
            Err(ControlError::Rejected {
                reply: reply.line,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{
            Read,
            Write,
        },
        net::TcpListener,
    };

    use super::*;

    /// Serve scripted responses: each accepted request line gets the
    /// next canned reply.
    fn scripted_server(replies: Vec<&'static str>) -> (std::thread::JoinHandle<Vec<String>>, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = vec![];
            let mut buffer = [0u8; 512];
            for reply in replies {
                let n = stream.read(&mut buffer).unwrap();
                received.push(String::from_utf8_lossy(&buffer[..n]).into_owned());
                stream.write_all(reply.as_bytes()).unwrap();
            }
            received
        });
        (handle, port)
    }

    #[test]
    fn commands_are_crlf_terminated() {
        let (server, port) = scripted_server(vec!["OK\r\n"]);
        let session = ControlSession::connect("127.0.0.1", port).unwrap();
        let reply = session.transact("quit").unwrap();
        assert!(reply.is_ok());
        let received = server.join().unwrap();
        assert_eq!(received, vec!["quit\r\n"]);
    }

    #[test]
    fn reply_fields_parse() {
        let (_server, port) =
            scripted_server(vec!["OK SampleRate=192000 BlockInSamples=2048 L0=7100000 \r\n"]);
        let session = ControlSession::connect("127.0.0.1", port).unwrap();
        let reply = session.expect_ok("attach 2").unwrap();
        assert_eq!(reply.int_field("SampleRate"), Some(192_000));
        assert_eq!(reply.int_field("BlockInSamples"), Some(2048));
        assert_eq!(reply.int_field("L0"), Some(7_100_000));
        assert_eq!(reply.int_field("Missing"), None);
    }

    #[test]
    fn rejection_carries_the_reply() {
        let (_server, port) = scripted_server(vec!["ERROR receiver busy\r\n"]);
        let session = ControlSession::connect("127.0.0.1", port).unwrap();
        match session.expect_ok("attach 0") {
            Err(ControlError::Rejected { reply }) => assert_eq!(reply, "ERROR receiver busy"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}

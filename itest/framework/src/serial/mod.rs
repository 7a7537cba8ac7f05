// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to a guest's serial console.
//!
//! The console is a pair of byte streams: the VMM's stdout carries what the
//! guest writes to its serial port, and the VMM's stdin feeds the guest's
//! serial input. [`SerialConsole`] wraps both, mirrors received lines to an
//! optional log file, and supports two ways of scripting an interaction:
//! a blocking [`SerialConsole::rx`] that waits for a token, and the
//! character-driven state machine in [`session`].

use std::{
    borrow::Cow,
    fs::File,
    io::{self, BufReader, BufWriter, ErrorKind, Read, Write},
};

use anyhow::Context;
use camino::Utf8Path;
use tracing::{debug, error, trace};

pub mod session;

pub use session::{run_session, PatternMatcher, SerialRx, SessionState};

/// Sink for text sent to a serial console.
pub trait SerialTx {
    /// Sends `s` followed by a newline.
    fn tx(&mut self, s: &str) -> io::Result<()>;
}

/// An entry in a sequence of interactions with the guest's serial console.
#[derive(Clone, Debug)]
pub enum CommandSequenceEntry {
    /// Wait for the supplied string to appear on the serial console.
    WaitFor(Cow<'static, str>),

    /// Write the supplied string, followed by a newline, to the console.
    WriteStr(Cow<'static, str>),
}

#[derive(Clone, Debug)]
pub struct CommandSequence(pub Vec<CommandSequenceEntry>);

impl CommandSequence {
    /// Logs in as root at a `login:` / `Password:` prompt pair and waits for a
    /// root shell prompt.
    pub fn root_login() -> Self {
        use CommandSequenceEntry::*;
        Self(vec![
            WaitFor("login: ".into()),
            WriteStr("root".into()),
            WaitFor("Password: ".into()),
            WriteStr("root".into()),
            WaitFor("#".into()),
        ])
    }
}

/// A guest serial console backed by a reader of guest output and a writer of
/// guest input.
pub struct SerialConsole<R: Read, W: Write> {
    rx: BufReader<R>,
    tx: W,
    log: Option<BufWriter<File>>,
    line_buffer: Vec<u8>,
}

impl<R: Read, W: Write> SerialConsole<R, W> {
    pub fn new(rx: R, tx: W) -> Self {
        Self { rx: BufReader::new(rx), tx, log: None, line_buffer: Vec::new() }
    }

    /// Mirrors every line received from here on to the file at `path`.
    pub fn with_log_file(mut self, path: &Utf8Path) -> anyhow::Result<Self> {
        let file = File::create(path).with_context(|| {
            format!("opening serial console log file {path}")
        })?;
        self.log = Some(BufWriter::new(file));
        Ok(self)
    }

    /// Blocks until the guest writes one more byte and returns it as a
    /// character. Bytes are mapped one-to-one onto the first 256 code points,
    /// which is exact for the ASCII prompts the harness waits for.
    pub fn rx_char(&mut self) -> io::Result<char> {
        let mut byte = [0u8; 1];
        loop {
            match self.rx.read(&mut byte) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "serial console closed",
                    ))
                }
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.log_byte(byte[0]);
        Ok(char::from(byte[0]))
    }

    /// Reads until `token` has been received and returns everything read,
    /// including the token itself.
    pub fn rx(&mut self, token: &str) -> io::Result<String> {
        let mut received = String::new();
        while !received.ends_with(token) {
            received.push(self.rx_char()?);
        }

        trace!(token, len = received.len(), "serial console token seen");
        Ok(received)
    }

    /// Plays back `sequence`, blocking on each wait in turn.
    pub fn run_sequence(&mut self, sequence: &CommandSequence) -> io::Result<()> {
        for step in &sequence.0 {
            match step {
                CommandSequenceEntry::WaitFor(s) => {
                    debug!(wait_for = %s, "waiting on serial console");
                    self.rx(s)?;
                }
                CommandSequenceEntry::WriteStr(s) => self.tx(s)?,
            }
        }

        Ok(())
    }

    fn log_byte(&mut self, byte: u8) {
        let Some(log) = self.log.as_mut() else {
            return;
        };

        if byte != b'\n' {
            self.line_buffer.push(byte);
            return;
        }

        let res = log
            .write_all(&self.line_buffer)
            .and_then(|()| log.write_all(b"\n"))
            .and_then(|()| log.flush());
        if let Err(e) = res {
            error!(%e, "failed to write serial console log; disabling it");
            self.log = None;
        }

        self.line_buffer.clear();
    }
}

impl<R: Read, W: Write> SerialTx for SerialConsole<R, W> {
    fn tx(&mut self, s: &str) -> io::Result<()> {
        debug!(s, "sending to serial console");
        self.tx.write_all(s.as_bytes())?;
        self.tx.write_all(b"\n")?;
        self.tx.flush()
    }
}

impl<R: Read, W: Write> SerialRx for SerialConsole<R, W> {
    fn rx_char(&mut self) -> io::Result<char> {
        SerialConsole::rx_char(self)
    }
}

impl<R: Read, W: Write> Drop for SerialConsole<R, W> {
    fn drop(&mut self) {
        if let Some(log) = self.log.as_mut() {
            let res = log
                .write_all(&self.line_buffer)
                .and_then(|()| log.flush());
            if let Err(e) = res {
                error!(%e, "failed to flush serial console log");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use camino::Utf8PathBuf;

    use super::*;

    fn console(input: &str) -> SerialConsole<Cursor<Vec<u8>>, Vec<u8>> {
        SerialConsole::new(Cursor::new(input.as_bytes().to_vec()), Vec::new())
    }

    #[test]
    fn rx_returns_text_through_the_token() {
        let mut c = console("Welcome\nhost login: rest");
        assert_eq!(c.rx("login: ").unwrap(), "Welcome\nhost login: ");
        assert_eq!(c.rx_char().unwrap(), 'r');
    }

    #[test]
    fn rx_at_eof_is_an_error() {
        let mut c = console("no token");
        assert_eq!(c.rx("#").unwrap_err().kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn tx_appends_a_newline() {
        let mut c = console("");
        c.tx("id").unwrap();
        c.tx("exit").unwrap();
        assert_eq!(c.tx, b"id\nexit\n");
    }

    #[test]
    fn root_login_sequence() {
        let mut c = console("Ubuntu\nubuntu-fc-uvm login: root\nPassword: \nroot@ubuntu-fc-uvm:~# ");
        c.run_sequence(&CommandSequence::root_login()).unwrap();
        assert_eq!(c.tx, b"root\nroot\n");
    }

    #[test]
    fn state_machine_runs_over_a_console() {
        let mut c = console("ubuntu-fc-uvm: uid=0(root) gid=0(root) groups=0(root)\n");
        let state = SessionState::login(
            "ubuntu-fc-uvm:",
            "id",
            "uid=0(root) gid=0(root) groups=0(root)",
        );
        run_session(&mut c, state).unwrap();
        assert_eq!(c.tx, b"id\n");
    }

    #[test]
    fn received_lines_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let path =
            Utf8PathBuf::from_path_buf(dir.path().join("serial.log")).unwrap();
        {
            let mut c = console("first\nsecond\npartial")
                .with_log_file(&path)
                .unwrap();
            c.rx("second\n").unwrap();
            assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
            c.rx("partial").unwrap();
        }

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "first\nsecond\npartial"
        );
    }
}

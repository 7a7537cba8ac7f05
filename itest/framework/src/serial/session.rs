// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A character-driven state machine for scripting an expect/send exchange
//! over a serial console.
//!
//! The machine never reads on its own: a driver feeds it one character at a
//! time (see [`run_session`]) and replaces the current state with whatever
//! [`SessionState::handle_input`] returns. Every state accepts every
//! character, so the driver can never get the machine stuck in an invalid
//! state; it can only wait forever for a pattern that never arrives, which
//! callers bound with their own timeouts.

use std::io;

use tracing::{debug, info};

use super::SerialTx;

/// Tracks how much of a literal pattern has been seen in sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatternMatcher {
    pattern: Vec<char>,
    matched: usize,
}

impl PatternMatcher {
    pub fn new(pattern: &str) -> Self {
        Self { pattern: pattern.chars().collect(), matched: 0 }
    }

    pub fn pattern(&self) -> String {
        self.pattern.iter().collect()
    }

    pub fn matched(&self) -> usize {
        self.matched
    }

    /// Advances the match with `c`. Returns true exactly when `c` completes
    /// the pattern, after which the count starts over.
    ///
    /// A character that breaks the sequence resets the count to zero and is
    /// not reconsidered, so an occurrence that overlaps a broken partial match
    /// is missed. An empty pattern never matches.
    pub fn feed(&mut self, c: char) -> bool {
        if self.pattern.is_empty() {
            return false;
        }

        if self.pattern[self.matched] == c {
            self.matched += 1;
        } else {
            self.matched = 0;
        }

        if self.matched == self.pattern.len() {
            self.matched = 0;
            true
        } else {
            false
        }
    }
}

/// The states of a login-then-run-one-command session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the login prompt. Once it appears, `command` is sent.
    WaitLogin {
        prompt: PatternMatcher,
        command: String,
        expected: String,
    },

    /// Waiting for the command's output to appear.
    WaitCommandOutput { expected: PatternMatcher },

    /// The exchange completed. All further input is ignored.
    Finished,
}

impl SessionState {
    /// Builds the initial state of a session that waits for `prompt`, sends
    /// `command`, and finishes once `expected` has been seen.
    pub fn login(prompt: &str, command: &str, expected: &str) -> Self {
        Self::WaitLogin {
            prompt: PatternMatcher::new(prompt),
            command: command.to_owned(),
            expected: expected.to_owned(),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Consumes one character of console output and returns the next state.
    ///
    /// Errors only come from sending on `tx`.
    pub fn handle_input<T: SerialTx + ?Sized>(
        self,
        tx: &mut T,
        c: char,
    ) -> io::Result<Self> {
        match self {
            Self::WaitLogin { mut prompt, command, expected } => {
                if prompt.feed(c) {
                    info!(%command, "login prompt seen, sending command");
                    tx.tx(&command)?;
                    Ok(Self::WaitCommandOutput {
                        expected: PatternMatcher::new(&expected),
                    })
                } else {
                    Ok(Self::WaitLogin { prompt, command, expected })
                }
            }
            Self::WaitCommandOutput { mut expected } => {
                if expected.feed(c) {
                    debug!(expected = %expected.pattern(), "command output seen");
                    Ok(Self::Finished)
                } else {
                    Ok(Self::WaitCommandOutput { expected })
                }
            }
            Self::Finished => Ok(Self::Finished),
        }
    }
}

/// Source of characters for [`run_session`].
pub trait SerialRx {
    /// Blocks until the next character arrives.
    fn rx_char(&mut self) -> io::Result<char>;
}

/// Feeds characters from `console` to the state machine until it finishes.
/// Blocks for as long as the expected output takes to appear.
pub fn run_session<C: SerialRx + SerialTx + ?Sized>(
    console: &mut C,
    mut state: SessionState,
) -> io::Result<()> {
    while !state.is_finished() {
        let c = console.rx_char()?;
        state = state.handle_input(console, c)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    #[derive(Default)]
    struct FakeConsole {
        input: VecDeque<char>,
        sent: Vec<String>,
    }

    impl FakeConsole {
        fn with_input(input: &str) -> Self {
            Self { input: input.chars().collect(), sent: Vec::new() }
        }
    }

    impl SerialTx for FakeConsole {
        fn tx(&mut self, s: &str) -> io::Result<()> {
            self.sent.push(s.to_owned());
            Ok(())
        }
    }

    impl SerialRx for FakeConsole {
        fn rx_char(&mut self) -> io::Result<char> {
            self.input.pop_front().ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "no more input")
            })
        }
    }

    #[test]
    fn matcher_fires_once_per_occurrence() {
        let mut m = PatternMatcher::new("ab");
        let hits: Vec<bool> = "xabyab".chars().map(|c| m.feed(c)).collect();
        assert_eq!(hits, [false, false, true, false, false, true]);
        assert_eq!(m.matched(), 0);
    }

    #[test]
    fn broken_partial_match_is_not_reconsidered() {
        let mut m = PatternMatcher::new("aab");
        assert!(!"aaab".chars().any(|c| m.feed(c)));
        assert_eq!(m.matched(), 0);

        // A clean occurrence after the break still matches.
        let hits: Vec<bool> = "aab".chars().map(|c| m.feed(c)).collect();
        assert_eq!(hits, [false, false, true]);
    }

    #[test]
    fn mismatch_on_the_first_character_starts_from_zero() {
        let mut m = PatternMatcher::new("login:");
        m.feed('l');
        m.feed('l');
        assert_eq!(m.matched(), 0);
        assert!(!"ogin:".chars().any(|c| m.feed(c)));
        assert!("login:".chars().any(|c| m.feed(c)));
    }

    #[test]
    fn matcher_resets_on_mismatch() {
        let mut m = PatternMatcher::new("abc");
        m.feed('a');
        m.feed('b');
        assert_eq!(m.matched(), 2);
        m.feed('x');
        assert_eq!(m.matched(), 0);
    }

    #[test]
    fn empty_pattern_never_matches() {
        let mut m = PatternMatcher::new("");
        assert!(!"anything".chars().any(|c| m.feed(c)));
    }

    #[test]
    fn unmatched_input_never_leaves_the_initial_state() {
        let initial = SessionState::login("ubuntu-fc-uvm:", "id", "uid=0");
        let mut console = FakeConsole::default();
        let mut state = initial.clone();
        for c in "ubuntu-fc-uvm ubuntu-fc-uv\n\u{1b}[0m login: ".chars() {
            state = state.handle_input(&mut console, c).unwrap();
            assert!(matches!(state, SessionState::WaitLogin { .. }));
        }
        assert!(console.sent.is_empty());
    }

    #[test]
    fn full_login_exchange() {
        let mut console = FakeConsole::with_input(
            "Booting...\nubuntu-fc-uvm: id\nuid=0(root) gid=0(root) groups=0(root)\n",
        );
        let state = SessionState::login(
            "ubuntu-fc-uvm:",
            "id",
            "uid=0(root) gid=0(root) groups=0(root)",
        );
        run_session(&mut console, state).unwrap();
        assert_eq!(console.sent, vec!["id".to_string()]);

        // The driver stops as soon as the output is seen.
        assert_eq!(console.input.iter().collect::<String>(), "\n");
    }

    #[test]
    fn prompt_transitions_exactly_once() {
        let mut console = FakeConsole::default();
        let mut state = SessionState::login("$ ", "true", "never printed");
        for c in "$ $ $ ".chars() {
            state = state.handle_input(&mut console, c).unwrap();
        }
        assert_eq!(console.sent.len(), 1);
        assert!(matches!(state, SessionState::WaitCommandOutput { .. }));
    }

    #[test]
    fn finished_absorbs_input() {
        let mut console = FakeConsole::default();
        let mut state = SessionState::Finished;
        for c in "login: uid=0".chars() {
            state = state.handle_input(&mut console, c).unwrap();
            assert!(state.is_finished());
        }
        assert!(console.sent.is_empty());
    }

    #[test]
    fn exhausted_console_is_an_error() {
        let mut console = FakeConsole::with_input("no prompt here");
        let err = run_session(&mut console, SessionState::login("#", "id", "uid"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}

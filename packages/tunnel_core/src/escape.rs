//! Per-DTE escape-sequence detection.
//!
//! A DTE reaches the monitor by sending two configured bytes back to back.
//! The first byte is held back until the next one shows whether it was the
//! start of the sequence or just data.

/// The two-byte sequence that diverts a DTE to the monitor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EscapeSequence {
    pub first: u8,
    pub second: u8,
}

impl EscapeSequence {
    pub fn new(first: u8, second: u8) -> Self {
        Self { first, second }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EscapeState {
    #[default]
    Normal,
    /// `first` was seen and swallowed
    Pending,
}

/// What the router should do with the byte just fed in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscapeAction {
    /// Hold the byte back; nothing to forward yet
    Swallow,
    /// Forward one byte to the current destination
    Forward(u8),
    /// Forward the held-back escape byte, then the current one
    ForwardPair(u8, u8),
    /// The full sequence arrived; try to attach the monitor
    Attach,
}

#[derive(Clone, Debug)]
pub struct EscapeDetector {
    sequence: EscapeSequence,
    state: EscapeState,
}

impl EscapeDetector {
    pub fn new(sequence: EscapeSequence) -> Self {
        Self {
            sequence,
            state: EscapeState::Normal,
        }
    }

    pub fn state(&self) -> EscapeState {
        self.state
    }

    /// Feed the next byte from the DTE.
    ///
    /// `diverted` is whether the DTE currently talks to the monitor; the
    /// sequence only arms while it does not.
    pub fn feed(&mut self, byte: u8, diverted: bool) -> EscapeAction {
        match self.state {
            EscapeState::Normal => {
                if byte == self.sequence.first && !diverted {
                    self.state = EscapeState::Pending;
                    EscapeAction::Swallow
                } else {
                    EscapeAction::Forward(byte)
                }
            }
            EscapeState::Pending => {
                self.state = EscapeState::Normal;
                if byte == self.sequence.second {
                    EscapeAction::Attach
                } else {
                    EscapeAction::ForwardPair(self.sequence.first, byte)
                }
            }
        }
    }
}

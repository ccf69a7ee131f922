//! Adapter bring-up steps

use obd_protocol::{AtCommand, Command, ObdProtocol};

/// Step of the adapter initialization sequence, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InitState {
    /// Not started, or stepped past the end
    #[default]
    Unknown,
    /// Full adapter reset (ATZ)
    Reset,
    /// Disable command echo (ATE0)
    EchoOff,
    /// Read adapter version (ATI)
    Version,
    /// Select protocol and trigger the bus search with the supported-PID query
    Search,
    /// Read back the negotiated protocol (ATDPN)
    ProtocolDetected,
    /// Adapter ready
    Complete,
}

impl InitState {
    /// All steps in order
    pub const ORDER: [InitState; 7] = [
        InitState::Unknown,
        InitState::Reset,
        InitState::EchoOff,
        InitState::Version,
        InitState::Search,
        InitState::ProtocolDetected,
        InitState::Complete,
    ];

    /// The following step; stepping past [`InitState::Complete`] yields `Unknown`
    pub fn next(self) -> Self {
        let index = Self::ORDER.iter().position(|s| *s == self).unwrap_or(0);
        Self::ORDER
            .get(index + 1)
            .copied()
            .unwrap_or(InitState::Unknown)
    }

    /// The AT command opening this step, if it sends one
    pub fn command(self, protocol: ObdProtocol) -> Option<Command> {
        let at = match self {
            InitState::Reset => AtCommand::Reset,
            InitState::EchoOff => AtCommand::EchoOff,
            InitState::Version => AtCommand::Version,
            InitState::Search => AtCommand::SetProtocol(protocol.number().unwrap_or(0)),
            InitState::ProtocolDetected => AtCommand::DescribeProtocolNumber,
            InitState::Unknown | InitState::Complete => return None,
        };
        Some(at.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_walks_in_order() {
        let mut state = InitState::Unknown;
        let mut seen = vec![state];
        while state != InitState::Complete {
            state = state.next();
            seen.push(state);
        }
        assert_eq!(seen, InitState::ORDER.to_vec());
    }

    #[test]
    fn test_next_after_complete_is_unknown() {
        assert_eq!(InitState::Complete.next(), InitState::Unknown);
        assert_eq!(InitState::Unknown.next(), InitState::Reset);
    }

    #[test]
    fn test_step_commands() {
        let auto = ObdProtocol::Auto;
        assert_eq!(InitState::Reset.command(auto).unwrap().line(), "ATZ");
        assert_eq!(InitState::EchoOff.command(auto).unwrap().line(), "ATE0");
        assert_eq!(InitState::Version.command(auto).unwrap().line(), "ATI");
        assert_eq!(InitState::Search.command(auto).unwrap().line(), "ATSP0");
        assert_eq!(
            InitState::Search
                .command(ObdProtocol::Iso15765_4Can11bit500)
                .unwrap()
                .line(),
            "ATSP6"
        );
        assert_eq!(InitState::ProtocolDetected.command(auto).unwrap().line(), "ATDPN");
        assert!(InitState::Complete.command(auto).is_none());
    }
}

//! Selector token namespace.
//!
//! Readiness events carry only a token, so every registered source gets a
//! tagged one: two reserved sentinels at the top of the space, and
//! arithmetic tags for session slots and pending dials below.

use mio::Token;

use crate::session::Side;

/// The accept listener.
pub(crate) const LISTENER: Token = Token(usize::MAX);
/// The cross-thread waker.
pub(crate) const WAKER: Token = Token(usize::MAX - 1);

const TAG_SERVER: usize = 0;
const TAG_CLIENT: usize = 1;
const TAG_PENDING: usize = 2;
const TAG_MASK: usize = 3;

/// What a readiness token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Listener,
    Waker,
    Session(Side, usize),
    Pending(usize),
}

pub(crate) fn session_token(side: Side, slot: usize) -> Token {
    let tag = match side {
        Side::Server => TAG_SERVER,
        Side::Client => TAG_CLIENT,
    };
    Token((slot << 2) | tag)
}

pub(crate) fn pending_token(key: usize) -> Token {
    Token((key << 2) | TAG_PENDING)
}

pub(crate) fn decode(token: Token) -> TokenKind {
    match token {
        LISTENER => TokenKind::Listener,
        WAKER => TokenKind::Waker,
        Token(raw) => match raw & TAG_MASK {
            TAG_SERVER => TokenKind::Session(Side::Server, raw >> 2),
            TAG_CLIENT => TokenKind::Session(Side::Client, raw >> 2),
            TAG_PENDING => TokenKind::Pending(raw >> 2),
            _ => TokenKind::Waker,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        assert_eq!(
            decode(session_token(Side::Server, 0)),
            TokenKind::Session(Side::Server, 0)
        );
        assert_eq!(
            decode(session_token(Side::Client, 41)),
            TokenKind::Session(Side::Client, 41)
        );
        assert_eq!(decode(pending_token(7)), TokenKind::Pending(7));
        assert_eq!(decode(LISTENER), TokenKind::Listener);
        assert_eq!(decode(WAKER), TokenKind::Waker);
    }

    #[test]
    fn test_token_spaces_disjoint() {
        let server = session_token(Side::Server, 5);
        let client = session_token(Side::Client, 5);
        let pending = pending_token(5);
        assert_ne!(server, client);
        assert_ne!(server, pending);
        assert_ne!(client, pending);
    }
}

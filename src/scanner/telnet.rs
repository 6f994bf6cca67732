//! Just enough Telnet option negotiation to get a server to show its banner.
//!
//! Everything here works on byte buffers, the socket handling lives in the
//! probe.

pub const IAC: u8 = 0xff;
pub const DONT: u8 = 0xfe;
pub const DO: u8 = 0xfd;
pub const WONT: u8 = 0xfc;
pub const WILL: u8 = 0xfb;
pub const SB: u8 = 0xfa;
pub const SE: u8 = 0xf0;

const SUPPRESS_GO_AHEAD: u8 = 0x03;
const TERMINAL_TYPE: u8 = 0x18;
const WINDOW_SIZE: u8 = 0x1f;
const TERMINAL_SPEED: u8 = 0x20;
const LINEMODE: u8 = 0x22;
const AUTHENTICATION: u8 = 0x25;

/// Sent right after the server's first burst, before answering it.
#[rustfmt::skip]
pub const PROBE: [u8; 18] = [
    IAC, WONT, AUTHENTICATION,
    IAC, DO, SUPPRESS_GO_AHEAD,
    IAC, WONT, TERMINAL_TYPE,
    IAC, WONT, WINDOW_SIZE,
    IAC, WONT, TERMINAL_SPEED,
    IAC, WILL, LINEMODE,
];

/// What [`negotiate`] made of a buffer.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Negotiation {
    /// Answers to send back to the server.
    pub reply: Vec<u8>,
    /// Bytes fully processed; anything after them is an incomplete command.
    pub consumed: usize,
    /// Offset of the first byte of readable text, if any was found.
    pub text: Option<usize>,
}

fn answer(command: u8, option: u8) -> Option<u8> {
    match (command, option) {
        (WILL, SUPPRESS_GO_AHEAD) => Some(DO),
        (WILL, _) => Some(DONT),
        (DO, LINEMODE) => Some(WILL),
        (DO, _) => Some(WONT),
        _ => None,
    }
}

/// Walks the negotiation commands at the start of `buf`.
///
/// Stops at the first byte below 0x80 that is not part of a command, which
/// marks the start of text. A command cut off by the end of the buffer is
/// left unconsumed.
pub fn negotiate(buf: &[u8]) -> Negotiation {
    let mut out = Negotiation::default();
    let mut i = 0;

    while i < buf.len() {
        let byte = buf[i];
        if byte != IAC {
            if byte < 0x80 {
                out.text = Some(i);
                break;
            }
            i += 1;
            continue;
        }

        let Some(&command) = buf.get(i + 1) else { break };
        match command {
            WILL | WONT | DO | DONT => {
                let Some(&option) = buf.get(i + 2) else { break };
                if let Some(reply) = answer(command, option) {
                    out.reply.extend_from_slice(&[IAC, reply, option]);
                }
                i += 3;
            }
            SB => {
                let end = buf[i + 2..]
                    .windows(2)
                    .position(|w| w == [IAC, SE]);
                match end {
                    Some(offset) => i += 2 + offset + 2,
                    None => break,
                }
            }
            // Escaped 0xff or a bare command such as NOP or GA.
            _ => i += 2,
        }
        out.consumed = i;
    }

    if let Some(text) = out.text {
        out.consumed = text;
    }
    out
}

/// Cuts the banner out of the text following the negotiation: leading
/// non-printable bytes are dropped, the banner ends at the first NUL.
pub fn banner(text: &[u8]) -> String {
    let start = text
        .iter()
        .position(u8::is_ascii_graphic)
        .unwrap_or(text.len());
    let text = &text[start..];
    let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());

    String::from_utf8_lossy(&text[..end])
        .trim_end_matches(|c: char| c.is_ascii_control())
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[rustfmt::skip]
    fn refuses_everything_but_sga_and_linemode() {
        let burst = [
            IAC, DO, TERMINAL_TYPE,
            IAC, WILL, SUPPRESS_GO_AHEAD,
            IAC, WILL, 0x01,
            IAC, DO, LINEMODE,
            IAC, DONT, WINDOW_SIZE,
        ];
        let n = negotiate(&burst);

        assert_eq!(
            n.reply,
            [
                IAC, WONT, TERMINAL_TYPE,
                IAC, DO, SUPPRESS_GO_AHEAD,
                IAC, DONT, 0x01,
                IAC, WILL, LINEMODE,
            ]
        );
        assert_eq!(n.consumed, burst.len());
        assert_eq!(n.text, None);
    }

    #[test]
    fn finds_the_banner_after_negotiation() {
        let mut stream = vec![IAC, DO, TERMINAL_TYPE, IAC, SB, TERMINAL_SPEED, 0x01, IAC, SE];
        stream.extend_from_slice(b"\r\n\x01Welcome to leet.example.com\0\x07garbage");

        let n = negotiate(&stream);
        let text = n.text.unwrap();
        assert_eq!(n.consumed, text);
        assert_eq!(banner(&stream[text..]), "Welcome to leet.example.com");
    }

    #[test]
    fn truncated_command_is_kept_for_later() {
        let stream = [IAC, WILL, SUPPRESS_GO_AHEAD, IAC, DO];
        let n = negotiate(&stream);

        assert_eq!(n.reply, [IAC, DO, SUPPRESS_GO_AHEAD]);
        assert_eq!(n.consumed, 3);
        assert_eq!(n.text, None);

        // The rest arrives with the next read.
        let mut rest = stream[n.consumed..].to_vec();
        rest.extend_from_slice(&[LINEMODE, b'l', b'o', b'g', b'i', b'n', b':', 0]);
        let n = negotiate(&rest);
        assert_eq!(n.reply, [IAC, WILL, LINEMODE]);
        assert_eq!(banner(&rest[n.text.unwrap()..]), "login:");
    }

    #[test]
    fn truncated_subnegotiation_does_not_panic() {
        for len in 0..6 {
            let stream = [IAC, SB, TERMINAL_TYPE, 0x01, IAC, SE];
            let n = negotiate(&stream[..len]);
            assert!(n.text.is_none());
            assert!(n.consumed == 0 || n.consumed == 6);
        }
    }

    #[test]
    fn banner_without_printable_text_is_empty() {
        assert_eq!(banner(b"\r\n\x00abc"), "abc");
        assert_eq!(banner(b"\r\n"), "");
        assert_eq!(banner(b""), "");
    }
}

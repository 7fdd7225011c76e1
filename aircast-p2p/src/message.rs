//! Supplicant control-socket codec
//!
//! wpa_supplicant speaks a line-oriented protocol over its datagram control
//! socket. Outgoing requests are `VERB ARG1 ARG2 …`. Incoming lines are
//! either replies to the single in-flight request (`OK`, `FAIL`, or a
//! verb-specific body) or unsolicited events, recognizable by a leading
//! `<N>` priority token:
//!
//! ```text
//! <3>P2P-DEVICE-FOUND 4e:74:03:70:e2:c1 p2p_dev_addr=4e:74:03:70:e2:c1
//!     name='Aquaris M10' config_methods=0x188 wfd_dev_info=0x00111c440032
//! ```
//!
//! Event arguments are a mix of bare positional tokens and `key=value`
//! attributes; values may be quoted with single or double quotes. The codec
//! lifts attributes into a map while keeping every token positionally
//! addressable, so event handlers can state what they expect declaratively.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use crate::error::{P2pError, Result};

/// A message on the supplicant control socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// An outgoing request
    Request { verb: String, args: Vec<String> },
    /// A reply to the in-flight request
    Reply { raw: String },
    /// An unsolicited event
    Event(Event),
}

/// An unsolicited supplicant event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    priority: u8,
    name: String,
    tokens: Vec<String>,
    attrs: HashMap<String, String>,
}

impl Message {
    /// Start building a request
    pub fn request(verb: impl Into<String>) -> Self {
        Message::Request {
            verb: verb.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument to a request, rendered in its canonical textual
    /// form. No-op on replies and events.
    pub fn arg(mut self, value: impl Display) -> Self {
        if let Message::Request { args, .. } = &mut self {
            args.push(value.to_string());
        }
        self
    }

    /// Decode a line arriving on the control socket. Every inbound line is
    /// either an event (priority prefix present) or a reply.
    pub fn parse(input: &[u8]) -> Result<Self> {
        let line = String::from_utf8_lossy(input);
        let line = line.trim();

        if line.is_empty() {
            return Err(P2pError::MalformedMessage("empty message".to_string()));
        }

        if let Some(event) = Self::split_priority(line) {
            let (priority, rest) = event;
            let mut tokens = tokenize(rest)?;
            if tokens.is_empty() {
                return Err(P2pError::MalformedMessage(format!(
                    "event without a name: {line}"
                )));
            }

            let name = tokens.remove(0);
            let attrs = tokens
                .iter()
                .filter_map(|token| {
                    let (key, value) = token.split_once('=')?;
                    if key.is_empty()
                        || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        return None;
                    }
                    Some((key.to_string(), value.to_string()))
                })
                .collect();

            return Ok(Message::Event(Event {
                priority,
                name,
                tokens,
                attrs,
            }));
        }

        Ok(Message::Reply {
            raw: line.to_string(),
        })
    }

    /// Decode a serialized request line, the inverse of [`serialize`] for
    /// the outgoing direction.
    ///
    /// [`serialize`]: Message::serialize
    pub fn parse_request(line: &str) -> Result<Self> {
        let mut tokens = tokenize(line.trim())?;
        if tokens.is_empty() {
            return Err(P2pError::MalformedMessage("empty request".to_string()));
        }

        let verb = tokens.remove(0);
        Ok(Message::Request { verb, args: tokens })
    }

    /// Encode the message as a single newline-terminated line
    pub fn serialize(&self) -> String {
        match self {
            Message::Request { verb, args } => {
                let mut line = verb.clone();
                for arg in args {
                    line.push(' ');
                    line.push_str(arg);
                }
                line.push('\n');
                line
            }
            Message::Reply { raw } => format!("{raw}\n"),
            Message::Event(event) => {
                let mut line = format!("<{}>{}", event.priority, event.name);
                for token in &event.tokens {
                    line.push(' ');
                    line.push_str(token);
                }
                line.push('\n');
                line
            }
        }
    }

    /// Check for a literal `OK` reply
    pub fn is_ok(&self) -> bool {
        matches!(self, Message::Reply { raw } if raw == "OK")
    }

    /// Check for a literal `FAIL` reply
    pub fn is_fail(&self) -> bool {
        matches!(self, Message::Reply { raw } if raw == "FAIL")
    }

    fn split_priority(line: &str) -> Option<(u8, &str)> {
        let rest = line.strip_prefix('<')?;
        let (digit, rest) = rest.split_once('>')?;
        if digit.len() != 1 {
            return None;
        }
        let priority = digit.chars().next()?.to_digit(10)? as u8;
        Some((priority, rest))
    }
}

impl Event {
    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Positional token after the event name, `key=value` tokens included
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).map(String::as_str)
    }

    /// Positional token, converted to the requested type
    pub fn arg_parsed<T: FromStr>(&self, index: usize) -> Result<T> {
        let token = self
            .arg(index)
            .ok_or_else(|| P2pError::MissingField(format!("argument {index}")))?;
        token.parse().map_err(|_| {
            P2pError::MalformedMessage(format!("argument {index} has unexpected form: {token}"))
        })
    }

    /// Named attribute value, quotes already stripped
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Named attribute value, failing with `MissingField` when absent
    pub fn require_attr(&self, key: &str) -> Result<&str> {
        self.attr(key)
            .ok_or_else(|| P2pError::MissingField(key.to_string()))
    }

    /// Named attribute, converted to the requested type
    pub fn attr_parsed<T: FromStr>(&self, key: &str) -> Result<T> {
        let value = self.require_attr(key)?;
        value.parse().map_err(|_| {
            P2pError::MalformedMessage(format!("attribute {key} has unexpected form: {value}"))
        })
    }
}

/// Split a line on whitespace, honoring single- and double-quoted spans.
/// The quotes themselves are stripped from the token.
fn tokenize(input: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }

    if quote.is_some() {
        return Err(P2pError::MalformedMessage(format!(
            "unterminated quote in: {input}"
        )));
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_found_event() {
        let line = b"<3>P2P-DEVICE-FOUND 4e:74:03:70:e2:c1 p2p_dev_addr=4e:74:03:70:e2:c1 \
                     pri_dev_type=8-0050F204-2 name='Aquaris M10' config_methods=0x188 \
                     dev_capab=0x5 group_capab=0x0 wfd_dev_info=0x00111c440032 new=1";

        let message = Message::parse(line).unwrap();
        let Message::Event(event) = message else {
            panic!("expected an event");
        };

        assert_eq!(event.priority(), 3);
        assert_eq!(event.name(), "P2P-DEVICE-FOUND");
        assert_eq!(event.arg(0), Some("4e:74:03:70:e2:c1"));
        assert_eq!(event.attr("p2p_dev_addr"), Some("4e:74:03:70:e2:c1"));
        assert_eq!(event.attr("name"), Some("Aquaris M10"));
        assert_eq!(event.attr("wfd_dev_info"), Some("0x00111c440032"));
        assert_eq!(event.attr("missing"), None);
    }

    #[test]
    fn test_parse_group_started_event() {
        let line = b"<3>P2P-GROUP-STARTED p2p0 GO ssid=\"DIRECT-hB\" freq=2412 \
                     passphrase=\"HtP0qYon\" go_dev_addr=4e:74:03:64:95:a7";

        let Message::Event(event) = Message::parse(line).unwrap() else {
            panic!("expected an event");
        };

        assert_eq!(event.name(), "P2P-GROUP-STARTED");
        assert_eq!(event.arg(0), Some("p2p0"));
        assert_eq!(event.arg(1), Some("GO"));
        assert_eq!(event.attr("ssid"), Some("DIRECT-hB"));
        assert_eq!(event.attr_parsed::<u32>("freq").unwrap(), 2412);
    }

    #[test]
    fn test_parse_group_removed_reason() {
        let line = b"<3>P2P-GROUP-REMOVED p2p0 GO reason=FORMATION_FAILED";
        let Message::Event(event) = Message::parse(line).unwrap() else {
            panic!("expected an event");
        };

        assert_eq!(event.attr("reason"), Some("FORMATION_FAILED"));
    }

    #[test]
    fn test_parse_replies() {
        assert!(Message::parse(b"OK\n").unwrap().is_ok());
        assert!(Message::parse(b"FAIL\n").unwrap().is_fail());

        let body = Message::parse(b"1a:2b:3c:4d:5e:6f").unwrap();
        assert!(!body.is_ok() && !body.is_fail());
        assert!(matches!(body, Message::Reply { .. }));
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        assert!(Message::parse(b"").is_err());
        assert!(Message::parse(b"   \n").is_err());
        assert!(Message::parse(b"<3>P2P-DEVICE-FOUND name='Aquaris").is_err());
    }

    #[test]
    fn test_priority_prefix_classification() {
        // A line without a well-formed priority prefix is a reply.
        assert!(matches!(
            Message::parse(b"<xy>NOT-AN-EVENT").unwrap(),
            Message::Reply { .. }
        ));
        assert!(matches!(
            Message::parse(b"<12>NOT-AN-EVENT").unwrap(),
            Message::Reply { .. }
        ));
    }

    #[test]
    fn test_serialize_request() {
        let message = Message::request("P2P_CONNECT")
            .arg("4e:74:03:70:e2:c1")
            .arg("pbc");
        assert_eq!(message.serialize(), "P2P_CONNECT 4e:74:03:70:e2:c1 pbc\n");

        let message = Message::request("WFD_SUBELEM_SET").arg(0).arg("000600101C440032");
        assert_eq!(message.serialize(), "WFD_SUBELEM_SET 0 000600101C440032\n");

        assert_eq!(Message::request("ATTACH").serialize(), "ATTACH\n");
    }

    #[test]
    fn test_request_round_trip() {
        let requests = [
            Message::request("ATTACH"),
            Message::request("SET").arg("wifi_display").arg(1),
            Message::request("P2P_FIND").arg(30),
            Message::request("P2P_CONNECT").arg("4e:74:03:70:e2:c1").arg("pbc"),
            Message::request("P2P_GROUP_REMOVE").arg("p2p0"),
        ];

        for request in requests {
            let parsed = Message::parse_request(&request.serialize()).unwrap();
            assert_eq!(parsed, request);
        }
    }

    #[test]
    fn test_missing_field_errors() {
        let Message::Event(event) = Message::parse(b"<3>P2P-FIND-STOPPED").unwrap() else {
            panic!("expected an event");
        };

        assert!(matches!(
            event.require_attr("reason"),
            Err(P2pError::MissingField(_))
        ));
        assert!(matches!(
            event.arg_parsed::<u32>(0),
            Err(P2pError::MissingField(_))
        ));
    }
}

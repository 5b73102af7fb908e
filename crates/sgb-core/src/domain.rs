/// Canonical group id: the standard-base64 form every observed variant
/// normalizes to. Always padded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub String);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Member identifier: an E.164 phone number or an account UUID.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemberId(pub String);

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A mention placeholder location inside message text.
///
/// `start`/`length` are offsets into the message as sent by the daemon; the
/// identifier is authoritative, the placeholder character in the text is not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MentionSpan {
    pub id: MemberId,
    pub start: usize,
    pub length: usize,
}

/// One inbound message, consumed once per dispatch cycle.
///
/// `group_id` is the raw id exactly as the daemon sent it (any of the three
/// encodings); normalization happens at dispatch time.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub sender: MemberId,
    pub sender_name: Option<String>,
    pub group_id: Option<String>,
    pub text: String,
    pub mentions: Vec<MentionSpan>,
    pub timestamp: Option<u64>,
}

impl InboundMessage {
    pub fn is_direct(&self) -> bool {
        self.group_id.is_none()
    }
}

//! Classification of reassembled protocol lines.
//!
//! Every line the server sends announces what it is through its first byte (or,
//! for prompts, a two byte control sequence). [`classify`] is total: anything it
//! does not recognise is [`LineKind::Unknown`], and it is up to the session to
//! decide that such a line is a protocol violation.

/// Raw text of the prompt line the transport synthesises after a final block.
pub const PROMPT: &str = "\u{1}\u{1}";
/// Raw text of the line a server sends when it expects more input.
pub const MORE_PROMPT: &str = "\u{1}\u{2}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineKind {
    Error,
    Header,
    ResultRow,
    StartOfHeader,
    Redirect,
    Info,
    Prompt,
    MorePrompt,
    Unknown,
}

impl LineKind {
    /// Either kind of prompt ends the server's current message.
    pub fn is_prompt(self) -> bool {
        matches!(self, LineKind::Prompt | LineKind::MorePrompt)
    }
}

pub fn classify(line: &str) -> LineKind {
    let bytes = line.as_bytes();
    match bytes.first() {
        Some(b'!') => LineKind::Error,
        Some(b'&') => LineKind::StartOfHeader,
        Some(b'%') => LineKind::Header,
        Some(b'[') => LineKind::ResultRow,
        Some(b'^') => LineKind::Redirect,
        Some(b'#') => LineKind::Info,
        Some(0x01) => match bytes.get(1) {
            Some(0x01) => LineKind::Prompt,
            Some(0x02) => LineKind::MorePrompt,
            _ => LineKind::Unknown,
        },
        _ => LineKind::Unknown,
    }
}

/// A line as returned by the transport, annotated once with its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    text: String,
    kind: LineKind,
}

impl Line {
    pub fn new(text: String) -> Self {
        let kind = classify(&text);
        Self { text, kind }
    }

    pub fn prompt() -> Self {
        Self {
            text: PROMPT.to_string(),
            kind: LineKind::Prompt,
        }
    }

    pub fn kind(&self) -> LineKind {
        self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Text following the leading marker byte.
    pub fn payload(&self) -> &str {
        match self.kind {
            LineKind::Unknown => &self.text,
            LineKind::Prompt | LineKind::MorePrompt => "",
            _ => &self.text[1..],
        }
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

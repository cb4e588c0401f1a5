//! ESMTP capability tracking for a session.
use crate::response::Response;

/// The ESMTP extensions this engine recognizes. Servers advertise
/// plenty of other keywords; those are tolerated and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extension {
    EightBitMime,
    Pipelining,
    StartTls,
    Size,
    SmtpUtf8,
    Auth,
    Chunking,
}

impl Extension {
    const ALL: [Extension; 7] = [
        Extension::EightBitMime,
        Extension::Pipelining,
        Extension::StartTls,
        Extension::Size,
        Extension::SmtpUtf8,
        Extension::Auth,
        Extension::Chunking,
    ];

    /// The EHLO keyword that advertises this extension.
    pub fn keyword(self) -> &'static str {
        match self {
            Self::EightBitMime => "8BITMIME",
            Self::Pipelining => "PIPELINING",
            Self::StartTls => "STARTTLS",
            Self::Size => "SIZE",
            Self::SmtpUtf8 => "SMTPUTF8",
            Self::Auth => "AUTH",
            Self::Chunking => "CHUNKING",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|extension| extension.keyword().eq_ignore_ascii_case(keyword))
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// The set of extensions a server advertised, replaced wholesale
/// after each EHLO exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtensionSet {
    bits: u8,
}

impl ExtensionSet {
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    pub fn contains(&self, extension: Extension) -> bool {
        self.bits & extension.bit() != 0
    }

    pub fn insert(&mut self, extension: Extension) {
        self.bits |= extension.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Extension> + '_ {
        Extension::ALL
            .iter()
            .copied()
            .filter(|extension| self.contains(*extension))
    }

    /// Extract the advertised extensions from an EHLO response. The
    /// first line is the server's greeting; each subsequent line is a
    /// keyword optionally followed by parameters. Unknown keywords
    /// are ignored.
    pub fn from_ehlo_response(response: &Response) -> Self {
        let mut set = Self::empty();
        for line in response.content.lines().skip(1) {
            let mut fields = line.splitn(2, ' ');
            if let Some(keyword) = fields.next() {
                if let Some(extension) = Extension::from_keyword(keyword) {
                    set.insert(extension);
                }
            }
        }
        set
    }
}

impl FromIterator<Extension> for ExtensionSet {
    fn from_iter<I: IntoIterator<Item = Extension>>(iter: I) -> Self {
        let mut set = Self::empty();
        for extension in iter {
            set.insert(extension);
        }
        set
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn membership() {
        let mut set = ExtensionSet::empty();
        assert!(set.is_empty());
        assert!(!set.contains(Extension::Pipelining));

        set.insert(Extension::Pipelining);
        set.insert(Extension::StartTls);
        assert!(set.contains(Extension::Pipelining));
        assert!(set.contains(Extension::StartTls));
        assert!(!set.contains(Extension::Size));

        let collected: Vec<Extension> = set.iter().collect();
        assert_eq!(collected, vec![Extension::Pipelining, Extension::StartTls]);
    }

    #[test]
    fn keywords_round_trip_case_insensitively() {
        assert_eq!(
            Extension::from_keyword("8BITMIME"),
            Some(Extension::EightBitMime)
        );
        assert_eq!(
            Extension::from_keyword("pipelining"),
            Some(Extension::Pipelining)
        );
        assert_eq!(Extension::from_keyword("X-EXPERIMENTAL"), None);
    }

    #[test]
    fn parses_an_ehlo_response() {
        let response = Response::with_code_and_message(
            250,
            "smtp.example.com greets sender.example.com\n\
             8BITMIME\n\
             SIZE 35882577\n\
             AUTH PLAIN LOGIN\n\
             X-NONSTANDARD\n\
             pipelining",
        );

        let set = ExtensionSet::from_ehlo_response(&response);
        assert!(set.contains(Extension::EightBitMime));
        assert!(set.contains(Extension::Size));
        assert!(set.contains(Extension::Auth));
        assert!(set.contains(Extension::Pipelining));
        assert!(!set.contains(Extension::StartTls));
        assert!(!set.contains(Extension::Chunking));
    }

    #[test]
    fn the_greeting_line_is_not_a_keyword() {
        let response = Response::with_code_and_message(250, "SIZE.example.com greets you");
        assert!(ExtensionSet::from_ehlo_response(&response).is_empty());
    }

    #[test]
    fn collects_from_an_iterator() {
        let set: ExtensionSet =
            [Extension::Auth, Extension::Chunking].into_iter().collect();
        assert!(set.contains(Extension::Auth));
        assert!(set.contains(Extension::Chunking));
        assert!(!set.contains(Extension::Pipelining));
    }
}

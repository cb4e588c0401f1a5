//! Client-composed SMTP commands and their wire encoding.
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Domain {
    Name(String),
    V4(String),
    V6(String),
}

impl fmt::Display for Domain {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Name(name) => fmt.write_str(name),
            Self::V4(addr) => write!(fmt, "[{addr}]"),
            Self::V6(addr) => write!(fmt, "[IPv6:{addr}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub local_part: String,
    pub domain: Domain,
}

impl fmt::Display for Mailbox {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}@{}", self.local_part, self.domain)
    }
}

fn mailbox_from(s: &str) -> Result<Mailbox, &'static str> {
    let fields: Vec<&str> = s.split('@').collect();
    if fields.len() == 2 {
        Ok(Mailbox {
            local_part: fields[0].to_string(),
            domain: Domain::Name(fields[1].to_string()),
        })
    } else {
        Err("wrong number of @ signs")
    }
}

/// The envelope sender. An empty string converts to the null sender
/// used for bounces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversePath {
    Mailbox(Mailbox),
    NullSender,
}

impl TryFrom<&str> for ReversePath {
    type Error = &'static str;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.is_empty() {
            Ok(Self::NullSender)
        } else {
            mailbox_from(s).map(Self::Mailbox)
        }
    }
}

impl fmt::Display for ReversePath {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Mailbox(mailbox) => mailbox.fmt(fmt),
            Self::NullSender => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardPath {
    Mailbox(Mailbox),
    Postmaster,
}

impl TryFrom<&str> for ForwardPath {
    type Error = &'static str;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.is_empty() {
            Err("cannot send to the null sender")
        } else if s.eq_ignore_ascii_case("postmaster") {
            Ok(Self::Postmaster)
        } else {
            mailbox_from(s).map(Self::Mailbox)
        }
    }
}

impl fmt::Display for ForwardPath {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Mailbox(mailbox) => mailbox.fmt(fmt),
            Self::Postmaster => fmt.write_str("postmaster"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpParameter {
    pub name: String,
    pub value: Option<String>,
}

impl fmt::Display for EsmtpParameter {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match &self.value {
            Some(value) => write!(fmt, "{}={value}", self.name),
            None => fmt.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(Domain),
    Helo(Domain),
    MailFrom {
        address: ReversePath,
        parameters: Vec<EsmtpParameter>,
    },
    RcptTo {
        address: ForwardPath,
        parameters: Vec<EsmtpParameter>,
    },
    Data,
    Rset,
    Quit,
    Vrfy(String),
    Expn(String),
    Help(Option<String>),
    Noop(Option<String>),
    StartTls,
    Auth {
        sasl_mech: String,
        initial_response: Option<String>,
    },
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::Helo(domain) => format!("HELO {domain}\r\n"),
            Self::MailFrom {
                address,
                parameters,
            } => {
                format!("MAIL FROM:<{address}>{}\r\n", encode_params(parameters))
            }
            Self::RcptTo {
                address,
                parameters,
            } => {
                format!("RCPT TO:<{address}>{}\r\n", encode_params(parameters))
            }
            Self::Data => "DATA\r\n".to_string(),
            Self::Rset => "RSET\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
            Self::StartTls => "STARTTLS\r\n".to_string(),
            Self::Vrfy(param) => format!("VRFY {param}\r\n"),
            Self::Expn(param) => format!("EXPN {param}\r\n"),
            Self::Help(Some(param)) => format!("HELP {param}\r\n"),
            Self::Help(None) => "HELP\r\n".to_string(),
            Self::Noop(Some(param)) => format!("NOOP {param}\r\n"),
            Self::Noop(None) => "NOOP\r\n".to_string(),
            Self::Auth {
                sasl_mech,
                initial_response: None,
            } => format!("AUTH {sasl_mech}\r\n"),
            Self::Auth {
                sasl_mech,
                initial_response: Some(resp),
            } => format!("AUTH {sasl_mech} {resp}\r\n"),
        }
    }

    /// The command verb as it appears on the wire, used in pipelining
    /// validation and submission descriptors.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
            Self::MailFrom { .. } => "MAIL",
            Self::RcptTo { .. } => "RCPT",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Quit => "QUIT",
            Self::Vrfy(_) => "VRFY",
            Self::Expn(_) => "EXPN",
            Self::Help(_) => "HELP",
            Self::Noop(_) => "NOOP",
            Self::StartTls => "STARTTLS",
            Self::Auth { .. } => "AUTH",
        }
    }
}

fn encode_params(parameters: &[EsmtpParameter]) -> String {
    let mut params = String::new();
    for p in parameters {
        params.push(' ');
        params.push_str(&p.to_string());
    }
    params
}

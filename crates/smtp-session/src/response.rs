use serde::{Deserialize, Serialize};

/// A complete SMTP response: the reply code, the optional RFC 3463
/// enhanced status code, and the (possibly multi-line) text with
/// lines joined by `\n`.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Hash)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    #[serde(serialize_with = "as_single_line")]
    pub content: String,
}

impl Response {
    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);

        if let Some(enh) = &self.enhanced_code {
            line.push_str(&format!("{}.{}.{} ", enh.class, enh.subject, enh.detail));
        }

        line.push_str(&flatten_line_breaks(&self.content));

        line
    }

    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    pub fn with_code_and_message(code: u16, message: &str) -> Self {
        let lines: Vec<&str> = message.lines().collect();

        let mut builder = ResponseBuilder::new(&ResponseLine {
            code,
            content: lines[0],
            is_final: lines.len() == 1,
        });

        for (n, line) in lines.iter().enumerate().skip(1) {
            builder
                .add_line(&ResponseLine {
                    code,
                    content: line,
                    is_final: n == lines.len() - 1,
                })
                .ok();
        }

        builder.build()
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Hash)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

fn parse_enhanced_status_code(line: &str) -> Option<(EnhancedStatusCode, &str)> {
    let mut fields = line.splitn(3, '.');
    let class = fields.next()?.parse::<u8>().ok()?;
    if !matches!(class, 2 | 4 | 5) {
        // No other classes are defined
        return None;
    }
    let subject = fields.next()?.parse::<u16>().ok()?;

    let remainder = fields.next()?;
    let mut fields = remainder.splitn(2, ' ');
    let detail = fields.next()?.parse::<u16>().ok()?;
    let remainder = fields.next()?;

    Some((
        EnhancedStatusCode {
            class,
            subject,
            detail,
        },
        remainder,
    ))
}

fn flatten_line_breaks(data: &str) -> String {
    let bytes = data.as_bytes();
    let mut flattened = String::with_capacity(data.len());
    let mut last_idx = 0;

    for i in memchr::memchr2_iter(b'\r', b'\n', bytes) {
        flattened.push_str(&data[last_idx..i]);
        // A CR immediately followed by LF collapses on the LF
        if !(bytes[i] == b'\r' && bytes.get(i + 1) == Some(&b'\n')) {
            flattened.push(' ');
        }
        last_idx = i + 1;
    }

    flattened.push_str(&data[last_idx..]);
    flattened
}

/// One parsed `CODE[- ]TEXT` line of a response.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

impl<'a> ResponseLine<'a> {
    /// Reconstitute the original line that we parsed
    fn to_original_line(&self) -> String {
        format!(
            "{}{}{}",
            self.code,
            if self.is_final { " " } else { "-" },
            self.content
        )
    }
}

/// Accumulates the lines of a multi-line response. Every line must
/// repeat the code of the first; the enhanced status code is taken
/// from the first line and stripped from subsequent lines that
/// repeat it.
pub(crate) struct ResponseBuilder {
    code: u16,
    enhanced_code: Option<EnhancedStatusCode>,
    content: String,
}

impl ResponseBuilder {
    pub fn new(parsed: &ResponseLine) -> Self {
        let code = parsed.code;
        let (enhanced_code, content) = match parse_enhanced_status_code(parsed.content) {
            Some((enhanced, content)) => (Some(enhanced), content.to_string()),
            None => (None, parsed.content.to_string()),
        };

        Self {
            code,
            enhanced_code,
            content,
        }
    }

    pub fn add_line(&mut self, parsed: &ResponseLine) -> Result<(), String> {
        if parsed.code != self.code {
            return Err(parsed.to_original_line());
        }

        self.content.push('\n');

        let mut content = parsed.content;

        if let Some(enh) = &self.enhanced_code {
            let prefix = format!("{}.{}.{} ", enh.class, enh.subject, enh.detail);
            if let Some(remainder) = parsed.content.strip_prefix(&prefix) {
                content = remainder;
            }
        }

        self.content.push_str(content);
        Ok(())
    }

    pub fn build(self) -> Response {
        Response {
            code: self.code,
            content: self.content,
            enhanced_code: self.enhanced_code,
        }
    }
}

fn as_single_line<S>(content: &String, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&flatten_line_breaks(content))
}

//! SMTP reply formatting (RFC 5321 §4.2), with ENHANCEDSTATUSCODES
//! (RFC 3463) prefixes since the receive session always advertises that
//! extension (spec §4.J).

use std::fmt;

#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u16,
    pub enhanced: &'static str,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, enhanced: &'static str, text: impl Into<String>) -> Self {
        Self {
            code,
            enhanced,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, enhanced: &'static str, lines: Vec<String>) -> Self {
        Self { code, enhanced, lines }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Renders as wire bytes: `<code>-<text>\r\n` for all but the last
    /// line, `<code> <text>\r\n` for the last.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let last = self.lines.len().saturating_sub(1);
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            if i == 0 {
                out.extend_from_slice(format!("{}{}{} {line}\r\n", self.code, sep, self.enhanced).as_bytes());
            } else {
                out.extend_from_slice(format!("{}{}{line}\r\n", self.code, sep).as_bytes());
            }
        }
        out
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{} {line}", self.code)?;
        }
        Ok(())
    }
}

pub fn ok(text: impl Into<String>) -> Reply {
    Reply::new(250, "2.0.0", text)
}

pub fn syntax_error(text: impl Into<String>) -> Reply {
    Reply::new(500, "5.5.2", text)
}

pub fn bad_sequence(text: impl Into<String>) -> Reply {
    Reply::new(503, "5.5.1", text)
}

pub fn transient(text: impl Into<String>) -> Reply {
    Reply::new(421, "4.3.0", text)
}

pub fn reject(text: impl Into<String>) -> Reply {
    Reply::new(550, "5.7.1", text)
}

pub fn size_exceeded(text: impl Into<String>) -> Reply {
    Reply::new(552, "5.3.4", text)
}

pub fn start_data() -> Reply {
    Reply::new(354, "", "start mail input; end with <CRLF>.<CRLF>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_reply_uses_space_separator() {
        let r = ok("queued");
        assert_eq!(r.to_wire(), b"250 2.0.0 queued\r\n");
    }

    #[test]
    fn multiline_reply_uses_dash_then_space() {
        let r = Reply::multiline(220, "", vec!["mx.example.com ESMTP".into(), "ready".into()]);
        assert_eq!(r.to_wire(), b"220-mx.example.com ESMTP\r\n220 ready\r\n");
    }

    #[test]
    fn start_data_has_no_enhanced_code_prefix() {
        let r = start_data();
        assert!(r.to_wire().starts_with(b"354 "));
    }
}

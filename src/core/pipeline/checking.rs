//! Wire format between the engine and checker programs.
//!
//! Data handed to a checker is a sequence of framed sections: a decimal byte length
//! on its own line followed by exactly that many bytes.

use itertools::Itertools;

use crate::core::domain::InteractiveResult;

const QUOTED_LINE_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("checker reported no score")]
    MissingScore,
    #[error("checker reported an invalid score `{0}`")]
    InvalidScore(String),
    #[error("checker printed an unexpected line `{0}`")]
    UnexpectedLine(String),
}

pub fn frame_section(section: &str) -> String {
    format!("{}\n{section}", section.len())
}

pub fn frame_sections<'a>(sections: impl IntoIterator<Item = &'a str>) -> String {
    sections.into_iter().map(frame_section).collect()
}

fn parse_score(token: &str) -> Result<f64, ProtocolError> {
    match token.parse::<f64>() {
        Ok(score) if score.is_finite() => Ok(score),
        _ => Err(ProtocolError::InvalidScore(quote(token))),
    }
}

/// Output of an OUTPUT_CHECKING checker: the first non-blank line is the score, the rest the message.
pub fn parse_verdict(stdout: &str) -> Result<InteractiveResult, ProtocolError> {
    let mut lines = stdout.lines().skip_while(|line| line.trim().is_empty());
    let score = lines.next().ok_or(ProtocolError::MissingScore)?;
    let score = parse_score(score.trim())?;
    let message = lines.join("\n");
    Ok(InteractiveResult::new(score, message.trim()))
}

/// One line written by an interactive checker.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckerLine {
    /// `? <text>`: forward `<text>` to the submission and return its reply.
    Prompt(Vec<u8>),
    /// `! <score> [message]`: the session is over.
    Final(InteractiveResult),
}

pub fn parse_checker_line(line: &[u8]) -> Result<CheckerLine, ProtocolError> {
    match line.split_first() {
        Some((b'?', rest)) => Ok(CheckerLine::Prompt(
            rest.strip_prefix(b" ").unwrap_or(rest).to_vec(),
        )),
        Some((b'!', rest)) => {
            let text = String::from_utf8_lossy(rest);
            let text = text.trim();
            if text.is_empty() {
                return Err(ProtocolError::MissingScore);
            }
            let (score, message) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
            Ok(CheckerLine::Final(InteractiveResult::new(
                parse_score(score)?,
                message.trim(),
            )))
        }
        _ => Err(ProtocolError::UnexpectedLine(quote(&String::from_utf8_lossy(
            line,
        )))),
    }
}

fn quote(text: &str) -> String {
    text.chars().take(QUOTED_LINE_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sections() {
        assert_eq!(frame_sections(["1 2\n", "", "3"]), "4\n1 2\n0\n1\n3");
        assert_eq!(frame_section("ї"), "2\nї");
    }

    #[test]
    fn test_parse_verdict() {
        assert_eq!(
            parse_verdict("\n  75.5 \nclose enough\nsee line 3\n").unwrap(),
            InteractiveResult::new(75.5, "close enough\nsee line 3")
        );
        assert_eq!(parse_verdict("100").unwrap(), InteractiveResult::new(100.0, ""));
    }

    #[test]
    fn test_parse_verdict_rejects_garbage() {
        assert_eq!(parse_verdict(" \n\n"), Err(ProtocolError::MissingScore));
        assert_eq!(
            parse_verdict("ok\n"),
            Err(ProtocolError::InvalidScore("ok".to_string()))
        );
        assert!(matches!(parse_verdict("NaN"), Err(ProtocolError::InvalidScore(_))));
        assert!(matches!(parse_verdict("inf"), Err(ProtocolError::InvalidScore(_))));
    }

    #[test]
    fn test_parse_checker_lines() {
        assert_eq!(
            parse_checker_line(b"? 3 5").unwrap(),
            CheckerLine::Prompt(b"3 5".to_vec())
        );
        assert_eq!(parse_checker_line(b"?").unwrap(), CheckerLine::Prompt(Vec::new()));
        assert_eq!(
            parse_checker_line(b"! 40 two of five").unwrap(),
            CheckerLine::Final(InteractiveResult::new(40.0, "two of five"))
        );
        assert_eq!(
            parse_checker_line(b"!100").unwrap(),
            CheckerLine::Final(InteractiveResult::new(100.0, ""))
        );
    }

    #[test]
    fn test_parse_checker_line_violations() {
        assert_eq!(parse_checker_line(b"!"), Err(ProtocolError::MissingScore));
        assert_eq!(
            parse_checker_line(b"hello"),
            Err(ProtocolError::UnexpectedLine("hello".to_string()))
        );
        assert_eq!(
            parse_checker_line(b""),
            Err(ProtocolError::UnexpectedLine(String::new()))
        );
        let long = vec![b'x'; 1000];
        match parse_checker_line(&long) {
            Err(ProtocolError::UnexpectedLine(quoted)) => assert_eq!(quoted.len(), QUOTED_LINE_LIMIT),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}

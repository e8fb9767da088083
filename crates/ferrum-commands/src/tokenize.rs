//! Shell-like splitting of command text.

/// One word of the input, with its byte offset for "rest of input" parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub start: usize,
}

/// Splits `input` into tokens.
///
/// Handles:
/// - Whitespace-separated words
/// - Quoted strings (single and double quotes) as one token
/// - Backslash escapes within double quotes
///
/// An unterminated quote runs to the end of the input.
pub fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut start = None;
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut escape_next = false;

    for (offset, ch) in input.char_indices() {
        if escape_next {
            current.push(ch);
            escape_next = false;
            continue;
        }

        match ch {
            '\\' if in_double_quote => {
                escape_next = true;
            }
            '\'' if !in_double_quote => {
                start.get_or_insert(offset);
                in_single_quote = !in_single_quote;
            }
            '"' if !in_single_quote => {
                start.get_or_insert(offset);
                in_double_quote = !in_double_quote;
            }
            c if c.is_whitespace() && !in_single_quote && !in_double_quote => {
                if let Some(begin) = start.take() {
                    tokens.push(Token {
                        text: std::mem::take(&mut current),
                        start: begin,
                    });
                }
            }
            _ => {
                start.get_or_insert(offset);
                current.push(ch);
            }
        }
    }

    if let Some(begin) = start {
        tokens.push(Token {
            text: current,
            start: begin,
        });
    }

    tokens
}

/// Convenience wrapper returning only the token texts.
pub fn shell_split(input: &str) -> Vec<String> {
    tokenize(input).into_iter().map(|t| t.text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_split_simple() {
        let args = shell_split("echo hello world");
        assert_eq!(args, vec!["echo", "hello", "world"]);
    }

    #[test]
    fn test_shell_split_quoted() {
        let args = shell_split(r#"echo "hello world" test"#);
        assert_eq!(args, vec!["echo", "hello world", "test"]);
    }

    #[test]
    fn test_shell_split_mixed_quotes() {
        let args = shell_split(r#"cmd "double's quote" 'single"s quote'"#);
        assert_eq!(args, vec!["cmd", "double's quote", r#"single"s quote"#]);
    }

    #[test]
    fn test_escaped_quote_inside_double_quotes() {
        let args = shell_split(r#"say "a \"b\" c""#);
        assert_eq!(args, vec!["say", r#"a "b" c"#]);
    }

    #[test]
    fn test_empty_quotes_make_empty_token() {
        let args = shell_split(r#"set name """#);
        assert_eq!(args, vec!["set", "name", ""]);
    }

    #[test]
    fn test_shell_split_whitespace_only() {
        assert!(shell_split("   \t \n ").is_empty());
    }

    #[test]
    fn test_offsets_point_at_raw_text() {
        let input = "say  \"hi there\"   rest of it";
        let tokens = tokenize(input);
        assert_eq!(tokens[1].start, 5);
        assert_eq!(&input[tokens[2].start..], "rest of it");
    }
}

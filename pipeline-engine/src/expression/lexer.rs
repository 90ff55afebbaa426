// Expression Lexer
// Tokenizes condition predicates and splits template text into ${{ }}, $[ ] and $( ) segments

use std::fmt;

/// Tokens of the condition language
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Null,
    True,
    False,
    Number(f64),
    String(String),

    Identifier(String),

    // Operators
    Eq,  // ==
    Ne,  // !=
    Lt,  // <
    Le,  // <=
    Gt,  // >
    Ge,  // >=
    And, // &&
    Or,  // ||
    Not, // !
    Dot,
    Comma,

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "'{}'", s),
            Token::Identifier(s) => write!(f, "{}", s),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Eof => write!(f, "end of expression"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("lex error at position {position}: {message}")]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            position: 0,
        }
    }

    /// Tokenize the entire input, always terminated by `Token::Eof`
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Token::Eof);
        };
        self.position = pos;

        let single = match ch {
            '.' => Some(Token::Dot),
            ',' => Some(Token::Comma),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            _ => None,
        };
        if let Some(token) = single {
            self.advance();
            return Ok(token);
        }

        match ch {
            '=' => self.pair('=', Token::Eq, None, "expected '==' operator"),
            '!' => self.pair('=', Token::Ne, Some(Token::Not), ""),
            '<' => self.pair('=', Token::Le, Some(Token::Lt), ""),
            '>' => self.pair('=', Token::Ge, Some(Token::Gt), ""),
            '&' => self.pair('&', Token::And, None, "expected '&&' operator"),
            '|' => self.pair('|', Token::Or, None, "expected '||' operator"),
            '\'' => self.read_string(),
            '0'..='9' => self.read_number(),
            '-' => self.read_number(),
            'a'..='z' | 'A'..='Z' | '_' => Ok(self.read_identifier()),
            _ => Err(LexError {
                message: format!("unexpected character: '{}'", ch),
                position: pos,
            }),
        }
    }

    /// Consume a one- or two-character operator
    fn pair(
        &mut self,
        second: char,
        joined: Token,
        alone: Option<Token>,
        message: &str,
    ) -> Result<Token, LexError> {
        let pos = self.position;
        self.advance();
        if self.peek_char() == Some(second) {
            self.advance();
            return Ok(joined);
        }
        alone.ok_or_else(|| LexError {
            message: message.to_string(),
            position: pos,
        })
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek_char().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn read_string(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        self.advance(); // opening quote

        let mut value = String::new();
        loop {
            match self.advance() {
                Some((_, '\'')) => {
                    // '' is an escaped quote
                    if self.peek_char() == Some('\'') {
                        value.push('\'');
                        self.advance();
                    } else {
                        return Ok(Token::String(value));
                    }
                }
                Some((_, ch)) => value.push(ch),
                None => {
                    return Err(LexError {
                        message: "unterminated string".to_string(),
                        position: start,
                    })
                }
            }
        }
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        let mut num_str = String::new();

        if self.peek_char() == Some('-') {
            num_str.push('-');
            self.advance();
        }

        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_digit() || ch == '.' {
                num_str.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        num_str
            .parse::<f64>()
            .map(Token::Number)
            .map_err(|_| LexError {
                message: format!("invalid number: {}", num_str),
                position: start,
            })
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();
        while let Some(ch) = self.peek_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '-' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        match ident.to_lowercase().as_str() {
            "null" => Token::Null,
            "true" => Token::True,
            "false" => Token::False,
            _ => Token::Identifier(ident),
        }
    }
}

// =============================================================================
// Template text segmentation
// =============================================================================

/// A segment of template text
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// `${{ expr }}`, resolved during expansion
    CompileTime(String),
    /// `$[ expr ]`, resolved when the owning scope starts
    Runtime(String),
    /// `$(name)`, substituted from the variable environment when a step starts
    Macro(String),
    Text(String),
}

/// Split a string into literal text and expression segments
pub fn segments(input: &str) -> Vec<Segment> {
    let chars: Vec<char> = input.chars().collect();
    let len = chars.len();
    let mut results = Vec::new();
    let mut pos = 0;

    while pos < len {
        if chars[pos] == '$' && pos + 1 < len {
            let found = match chars[pos + 1] {
                '{' if pos + 2 < len && chars[pos + 2] == '{' => {
                    find_closing_braces(&chars, pos + 3).map(|end| {
                        let body = collect_trimmed(&chars[pos + 3..end]);
                        (Segment::CompileTime(body), end + 2)
                    })
                }
                '[' => find_closing(&chars, pos + 2, '[', ']').map(|end| {
                    let body = collect_trimmed(&chars[pos + 2..end]);
                    (Segment::Runtime(body), end + 1)
                }),
                '(' => find_closing(&chars, pos + 2, '(', ')').map(|end| {
                    let body = collect_trimmed(&chars[pos + 2..end]);
                    (Segment::Macro(body), end + 1)
                }),
                _ => None,
            };

            if let Some((segment, next)) = found {
                results.push(segment);
                pos = next;
                continue;
            }
        }

        // Accumulate plain text up to the next potential expression start
        let text_start = pos;
        pos += 1;
        while pos < len && chars[pos] != '$' {
            pos += 1;
        }
        let text: String = chars[text_start..pos].iter().collect();
        match results.last_mut() {
            Some(Segment::Text(prev)) => prev.push_str(&text),
            _ => results.push(Segment::Text(text)),
        }
    }

    results
}

/// If the whole (trimmed) string is exactly one `${{ expr }}`, return `expr`
pub fn sole_compile_time_expression(input: &str) -> Option<String> {
    match segments(input.trim()).as_slice() {
        [Segment::CompileTime(expr)] => Some(expr.clone()),
        _ => None,
    }
}

/// True when the string contains any `${{ }}` segment
pub fn has_compile_time_expression(input: &str) -> bool {
    input.contains("${{")
        && segments(input)
            .iter()
            .any(|s| matches!(s, Segment::CompileTime(_)))
}

fn collect_trimmed(chars: &[char]) -> String {
    chars.iter().collect::<String>().trim().to_string()
}

fn find_closing_braces(chars: &[char], start: usize) -> Option<usize> {
    let mut in_string = false;
    let mut i = start;
    while i + 1 < chars.len() {
        if chars[i] == '\'' {
            in_string = !in_string;
        } else if !in_string && chars[i] == '}' && chars[i + 1] == '}' {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn find_closing(chars: &[char], start: usize, opening: char, closing: char) -> Option<usize> {
    let mut depth = 1;
    let mut in_string = false;

    for (i, &ch) in chars.iter().enumerate().skip(start) {
        if ch == '\'' {
            in_string = !in_string;
        } else if !in_string {
            if ch == opening {
                depth += 1;
            } else if ch == closing {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token> {
        Lexer::new(input).tokenize().unwrap()
    }

    #[test]
    fn test_lexer_operators() {
        assert_eq!(
            tokens("== != < <= > >= && || !"),
            vec![
                Token::Eq,
                Token::Ne,
                Token::Lt,
                Token::Le,
                Token::Gt,
                Token::Ge,
                Token::And,
                Token::Or,
                Token::Not,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_lexer_escaped_string() {
        assert_eq!(
            tokens("'it''s'"),
            vec![Token::String("it's".to_string()), Token::Eof]
        );
    }

    #[test]
    fn test_lexer_keywords_case_insensitive() {
        assert_eq!(
            tokens("True FALSE null"),
            vec![Token::True, Token::False, Token::Null, Token::Eof]
        );
    }

    #[test]
    fn test_lexer_function_call() {
        assert_eq!(
            tokens("eq(variables.BuildDocs, 'true')"),
            vec![
                Token::Identifier("eq".to_string()),
                Token::LParen,
                Token::Identifier("variables".to_string()),
                Token::Dot,
                Token::Identifier("BuildDocs".to_string()),
                Token::Comma,
                Token::String("true".to_string()),
                Token::RParen,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_lexer_errors() {
        assert!(Lexer::new("'open").tokenize().is_err());
        assert!(Lexer::new("a = b").tokenize().is_err());
        assert!(Lexer::new("a & b").tokenize().is_err());
        assert!(Lexer::new("#").tokenize().is_err());
    }

    #[test]
    fn test_segments_mixed() {
        let parts = segments("echo ${{ parameters.name }} $(Build.Id) $[ variables.x ] done");
        assert_eq!(
            parts,
            vec![
                Segment::Text("echo ".to_string()),
                Segment::CompileTime("parameters.name".to_string()),
                Segment::Text(" ".to_string()),
                Segment::Macro("Build.Id".to_string()),
                Segment::Text(" ".to_string()),
                Segment::Runtime("variables.x".to_string()),
                Segment::Text(" done".to_string()),
            ]
        );
    }

    #[test]
    fn test_segments_unclosed_is_text() {
        assert_eq!(
            segments("cost $5 and ${{ broken"),
            vec![Segment::Text("cost $5 and ${{ broken".to_string())]
        );
    }

    #[test]
    fn test_sole_compile_time_expression() {
        assert_eq!(
            sole_compile_time_expression("  ${{ parameters.steps }} "),
            Some("parameters.steps".to_string())
        );
        assert_eq!(sole_compile_time_expression("x ${{ parameters.steps }}"), None);
        assert!(has_compile_time_expression("a ${{ b }}"));
        assert!(!has_compile_time_expression("$(b)"));
    }

    #[test]
    fn test_braces_inside_string_literal() {
        assert_eq!(
            sole_compile_time_expression("${{ format('{0}}', 'x') }}"),
            Some("format('{0}}', 'x')".to_string())
        );
    }
}

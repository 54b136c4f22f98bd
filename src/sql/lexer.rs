/// SQL Lexer - converts SQL source text into tokens
use super::token::{lookup_keyword, Token, TokenKind};

pub struct Lexer {
    input: Vec<char>,
    position: usize,
    line: usize,
    column: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
            line: 1,
            column: 1,
        }
    }

    /// Tokenize the whole input. The sequence always ends with an Eof token;
    /// bytes that fit no rule are skipped.
    pub fn tokenize(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let done = matches!(token.kind, TokenKind::Eof);
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    fn next_token(&mut self) -> Token {
        loop {
            self.skip_whitespace();

            if self.current() == '-' && self.peek() == Some('-') {
                self.skip_line_comment();
                continue;
            }
            if self.current() == '/' && self.peek() == Some('*') {
                self.skip_block_comment();
                continue;
            }

            let line = self.line;
            let column = self.column;

            if self.is_eof() {
                return Token::new(TokenKind::Eof, line, column);
            }

            let ch = self.current();
            let kind = match ch {
                '\'' | '"' => self.read_string(ch),
                '[' => self.read_quoted_identifier(']'),
                '`' => self.read_quoted_identifier('`'),
                '0'..='9' => self.read_number(),
                c if c.is_alphabetic() || c == '_' || c == '@' || c == '#' => {
                    self.read_identifier()
                }
                '<' => {
                    self.advance();
                    if self.current() == '>' {
                        self.advance();
                        TokenKind::Ne
                    } else if self.current() == '=' {
                        self.advance();
                        TokenKind::Le
                    } else {
                        TokenKind::Lt
                    }
                }
                '>' => {
                    self.advance();
                    if self.current() == '=' {
                        self.advance();
                        TokenKind::Ge
                    } else {
                        TokenKind::Gt
                    }
                }
                '!' => {
                    self.advance();
                    if self.current() == '=' {
                        self.advance();
                        TokenKind::Ne
                    } else {
                        // lone '!' fits no rule
                        continue;
                    }
                }
                ':' => {
                    self.advance();
                    if self.current() == '=' {
                        self.advance();
                        TokenKind::Assign
                    } else {
                        continue;
                    }
                }
                '=' => {
                    self.advance();
                    TokenKind::Eq
                }
                '+' => {
                    self.advance();
                    TokenKind::Plus
                }
                '-' => {
                    self.advance();
                    TokenKind::Minus
                }
                '*' => {
                    self.advance();
                    TokenKind::Star
                }
                '/' => {
                    self.advance();
                    TokenKind::Slash
                }
                '%' => {
                    self.advance();
                    TokenKind::Percent
                }
                '^' => {
                    self.advance();
                    TokenKind::Caret
                }
                '(' => {
                    self.advance();
                    TokenKind::LParen
                }
                ')' => {
                    self.advance();
                    TokenKind::RParen
                }
                ',' => {
                    self.advance();
                    TokenKind::Comma
                }
                ';' => {
                    self.advance();
                    TokenKind::Semicolon
                }
                '.' => {
                    self.advance();
                    TokenKind::Dot
                }
                _ => {
                    // unknown byte, skipped silently
                    self.advance();
                    continue;
                }
            };

            return Token::new(kind, line, column);
        }
    }

    fn current(&self) -> char {
        if self.is_eof() {
            '\0'
        } else {
            self.input[self.position]
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.position + 1).copied()
    }

    fn advance(&mut self) {
        if !self.is_eof() {
            if self.input[self.position] == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
            self.position += 1;
        }
    }

    fn is_eof(&self) -> bool {
        self.position >= self.input.len()
    }

    fn skip_whitespace(&mut self) {
        while !self.is_eof() && self.current().is_whitespace() {
            self.advance();
        }
    }

    fn skip_line_comment(&mut self) {
        while !self.is_eof() && self.current() != '\n' {
            self.advance();
        }
    }

    fn skip_block_comment(&mut self) {
        self.advance(); // '/'
        self.advance(); // '*'
        while !self.is_eof() {
            if self.current() == '*' && self.peek() == Some('/') {
                self.advance();
                self.advance();
                return;
            }
            self.advance();
        }
        // unterminated comment runs to end of input
    }

    /// String literal in single or double quotes. A doubled quote character
    /// denotes one literal quote.
    fn read_string(&mut self, quote: char) -> TokenKind {
        self.advance(); // opening quote
        let mut value = String::new();
        while !self.is_eof() {
            if self.current() == quote {
                if self.peek() == Some(quote) {
                    value.push(quote);
                    self.advance();
                    self.advance();
                    continue;
                }
                self.advance(); // closing quote
                break;
            }
            value.push(self.current());
            self.advance();
        }
        TokenKind::StringLit(value)
    }

    /// `[name]` or backtick-quoted identifier, emitted verbatim and never
    /// keyword-tagged.
    fn read_quoted_identifier(&mut self, closing: char) -> TokenKind {
        self.advance(); // opening bracket
        let mut value = String::new();
        while !self.is_eof() && self.current() != closing {
            value.push(self.current());
            self.advance();
        }
        self.advance(); // closing bracket
        TokenKind::Identifier(value)
    }

    /// Digits, optional fraction, optional exponent. Integer tokens contain
    /// neither a decimal point nor an exponent.
    fn read_number(&mut self) -> TokenKind {
        let mut text = String::new();
        let mut is_float = false;

        while !self.is_eof() && self.current().is_ascii_digit() {
            text.push(self.current());
            self.advance();
        }
        if self.current() == '.' && self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            is_float = true;
            text.push('.');
            self.advance();
            while !self.is_eof() && self.current().is_ascii_digit() {
                text.push(self.current());
                self.advance();
            }
        }
        if self.current() == 'e' || self.current() == 'E' {
            let mut probe = self.position + 1;
            if matches!(self.input.get(probe), Some('+') | Some('-')) {
                probe += 1;
            }
            if self.input.get(probe).map(|c| c.is_ascii_digit()).unwrap_or(false) {
                is_float = true;
                text.push(self.current());
                self.advance();
                if matches!(self.current(), '+' | '-') {
                    text.push(self.current());
                    self.advance();
                }
                while !self.is_eof() && self.current().is_ascii_digit() {
                    text.push(self.current());
                    self.advance();
                }
            }
        }

        if is_float {
            TokenKind::Float(text.parse().unwrap_or(0.0))
        } else {
            TokenKind::Integer(text.parse().unwrap_or(0))
        }
    }

    fn read_identifier(&mut self) -> TokenKind {
        let mut value = String::new();
        while !self.is_eof() {
            let ch = self.current();
            if ch.is_alphanumeric() || ch == '_' || ch == '@' || ch == '#' {
                value.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        match lookup_keyword(&value) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Identifier(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<TokenKind> {
        Lexer::new(sql).tokenize().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_lexer_simple_select() {
        let tokens = kinds("SELECT * FROM users");
        assert_eq!(tokens.len(), 5); // SELECT, *, FROM, users, EOF
        assert!(tokens[0].is_kw("SELECT"));
        assert_eq!(tokens[1], TokenKind::Star);
        assert!(tokens[2].is_kw("FROM"));
        assert!(matches!(tokens[3], TokenKind::Identifier(_)));
        assert_eq!(tokens[4], TokenKind::Eof);
    }

    #[test]
    fn test_lexer_keywords_case_insensitive() {
        let tokens = kinds("select Select SELECT");
        for t in &tokens[..3] {
            assert_eq!(*t, TokenKind::Keyword("SELECT"));
        }
    }

    #[test]
    fn test_lexer_doubled_quote_escape() {
        let tokens = kinds("'it''s' \"say \"\"hi\"\"\"");
        assert_eq!(tokens[0], TokenKind::StringLit("it's".into()));
        assert_eq!(tokens[1], TokenKind::StringLit("say \"hi\"".into()));
    }

    #[test]
    fn test_lexer_quoted_identifiers_verbatim() {
        let tokens = kinds("[Order Details] `select`");
        assert_eq!(tokens[0], TokenKind::Identifier("Order Details".into()));
        assert_eq!(tokens[1], TokenKind::Identifier("select".into()));
    }

    #[test]
    fn test_lexer_numbers() {
        let tokens = kinds("42 3.25 1e3 2.5E-2 7.e");
        assert_eq!(tokens[0], TokenKind::Integer(42));
        assert_eq!(tokens[1], TokenKind::Float(3.25));
        assert_eq!(tokens[2], TokenKind::Float(1000.0));
        assert_eq!(tokens[3], TokenKind::Float(0.025));
        // '7.e' with no digits after either: integer, then dot, then identifier
        assert_eq!(tokens[4], TokenKind::Integer(7));
        assert_eq!(tokens[5], TokenKind::Dot);
    }

    #[test]
    fn test_lexer_operators() {
        let tokens = kinds("= <> != < > <= >= := + - * / % ^");
        assert_eq!(tokens[0], TokenKind::Eq);
        assert_eq!(tokens[1], TokenKind::Ne);
        assert_eq!(tokens[2], TokenKind::Ne);
        assert_eq!(tokens[3], TokenKind::Lt);
        assert_eq!(tokens[4], TokenKind::Gt);
        assert_eq!(tokens[5], TokenKind::Le);
        assert_eq!(tokens[6], TokenKind::Ge);
        assert_eq!(tokens[7], TokenKind::Assign);
        assert_eq!(tokens[13], TokenKind::Caret);
    }

    #[test]
    fn test_lexer_comments_stripped() {
        let tokens = kinds("SELECT /* all\nof it */ * -- trailing\nFROM t");
        assert_eq!(tokens.len(), 5);
        assert!(tokens[2].is_kw("FROM"));
    }

    #[test]
    fn test_lexer_at_and_hash_identifiers() {
        let tokens = kinds("@price #tmp a@b");
        assert_eq!(tokens[0], TokenKind::Identifier("@price".into()));
        assert_eq!(tokens[1], TokenKind::Identifier("#tmp".into()));
        assert_eq!(tokens[2], TokenKind::Identifier("a@b".into()));
    }

    #[test]
    fn test_lexer_unknown_bytes_skipped() {
        let tokens = kinds("a ? b ! c");
        assert_eq!(tokens.len(), 4); // a, b, c, EOF
    }
}

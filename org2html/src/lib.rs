//! Org to HTML conversion pipeline.
//! Lines are classified into tokens, tokens are folded into document nodes, and
//! nodes render themselves as HTML fragments. Each stage is configured explicitly
//! at construction so single matchers and builders can be exercised in isolation.

pub mod error {
    use crate::token::TokenKind;

    /* ------------------------------ Tokenizing ------------------------------ */

    #[derive(Debug, thiserror::Error)]
    pub enum TokenizeError {
        #[error("no lexers can parse line {line_no}: {line:?}")]
        NoMatch { line_no: usize, line: String },
        #[error("reading input")]
        Io(#[from] std::io::Error),
    }

    /* ------------------------------ Timestamps ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum TimestampError {
        #[error("cannot parse {value:?} as {expected:?}")]
        Format {
            value: String,
            expected: &'static str,
        },
        #[error("unknown weekday {value:?}")]
        Weekday { value: String },
    }

    /* -------------------------------- Parsing -------------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum ParseError {
        #[error("unknown token: kind={kind} at token[{index}]")]
        UnknownKind { index: usize, kind: TokenKind },
        #[error("{kind} builder consumed no tokens at token[{index}]")]
        NoProgress { index: usize, kind: TokenKind },
        #[error("{kind} token[{index}] does not have {expected} values: got={got}")]
        ValueCount {
            index: usize,
            kind: TokenKind,
            expected: &'static str,
            got: usize,
        },
        #[error("headline token[{index}] has invalid format title: {title:?}")]
        HeadlineFormat { index: usize, title: String },
        #[error("keyword token[{index}] has an empty key")]
        EmptyKeywordKey { index: usize },
        #[error(
            "agenda token[{index}] item number and its values are unmatched: num={count}, vals={values}"
        )]
        AgendaShape {
            index: usize,
            count: usize,
            values: usize,
        },
        #[error("agenda token[{index}] has unknown key {key:?}")]
        AgendaKey { index: usize, key: String },
        #[error("agenda token[{index}] has an invalid timestamp")]
        Timestamp {
            index: usize,
            #[source]
            source: TimestampError,
        },
        #[error("block token[{index}] has an empty name")]
        EmptyBlockName { index: usize },
        #[error("token[{index}] is unexpected block end: got={got}, want={want}")]
        BlockMismatch {
            index: usize,
            got: String,
            want: String,
        },
        #[error("block {name} opened at token[{index}] is never closed")]
        UnterminatedBlock { index: usize, name: String },
    }

    /* ------------------------------- Rendering ------------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum RenderError {
        #[error("headline {title:?} has invalid depth 0")]
        HeadlineDepth { title: String },
        #[error("headline at depth {depth} has an empty title")]
        EmptyTitle { depth: usize },
        #[error("writing rendered output")]
        Io(#[from] std::io::Error),
    }
}

pub mod timestamp {
    //! Planning timestamps in the two fixed layouts `2022-01-30 Sun 10:03` and
    //! `2022-01-30 Sun`. The weekday must be a known abbreviation but is not
    //! checked against the date. Repeat intervals (`+1w`) are carried verbatim.

    use crate::error::TimestampError;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Weekday};
    use nom::{
        IResult,
        bytes::complete::take_while_m_n,
        character::complete::{char, space1},
        combinator::{all_consuming, map_res},
        error::VerboseError,
        sequence::tuple,
    };
    use serde::{Deserialize, Serialize};
    use std::fmt;

    const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %a %H:%M";
    const DATESTAMP_FORMAT: &str = "%Y-%m-%d %a";

    const TIMESTAMP_LAYOUT: &str = "YYYY-MM-DD Www HH:MM";
    const DATESTAMP_LAYOUT: &str = "YYYY-MM-DD Www";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Timestamp {
        /// Midnight when `date_only` is set.
        pub instant: NaiveDateTime,
        pub date_only: bool,
        /// Repeat cookie such as `+1w`; empty when absent.
        #[serde(default, skip_serializing_if = "String::is_empty")]
        pub interval: String,
    }

    impl Timestamp {
        pub fn date(&self) -> NaiveDate {
            self.instant.date()
        }

        pub fn time(&self) -> Option<NaiveTime> {
            (!self.date_only).then(|| self.instant.time())
        }

        /// Machine-readable form used for `datetime` attributes.
        pub fn iso(&self) -> String {
            if self.date_only {
                self.instant.format("%Y-%m-%d").to_string()
            } else {
                self.instant.format("%Y-%m-%dT%H:%M").to_string()
            }
        }
    }

    impl fmt::Display for Timestamp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let format = if self.date_only {
                DATESTAMP_FORMAT
            } else {
                TIMESTAMP_FORMAT
            };
            write!(f, "{}", self.instant.format(format))
        }
    }

    /// Parse `YYYY-MM-DD Www HH:MM`.
    pub fn parse_timestamp(value: &str, interval: &str) -> Result<Timestamp, TimestampError> {
        let (_, (date, _, weekday, _, time)) =
            all_consuming(tuple((parse_date, space1, weekday_name, space1, parse_time)))(value)
                .map_err(|_| TimestampError::Format {
                    value: value.to_string(),
                    expected: TIMESTAMP_LAYOUT,
                })?;
        check_weekday(weekday)?;
        Ok(Timestamp {
            instant: date.and_time(time),
            date_only: false,
            interval: interval.to_string(),
        })
    }

    /// Parse `YYYY-MM-DD Www`.
    pub fn parse_datestamp(value: &str, interval: &str) -> Result<Timestamp, TimestampError> {
        let (_, (date, _, weekday)) = all_consuming(tuple((parse_date, space1, weekday_name)))(
            value,
        )
        .map_err(|_| TimestampError::Format {
            value: value.to_string(),
            expected: DATESTAMP_LAYOUT,
        })?;
        check_weekday(weekday)?;
        Ok(Timestamp {
            instant: date.and_time(NaiveTime::MIN),
            date_only: true,
            interval: interval.to_string(),
        })
    }

    fn check_weekday(name: &str) -> Result<(), TimestampError> {
        name.parse::<Weekday>()
            .map(|_| ())
            .map_err(|_| TimestampError::Weekday {
                value: name.to_string(),
            })
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(digits(4), |s: &str| s.parse::<i32>()),
                char('-'),
                map_res(digits(2), |s: &str| s.parse::<u32>()),
                char('-'),
                map_res(digits(2), |s: &str| s.parse::<u32>()),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((
                map_res(digits(2), |s: &str| s.parse::<u32>()),
                char(':'),
                map_res(digits(2), |s: &str| s.parse::<u32>()),
            )),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0).ok_or("invalid time"),
        )(i)
    }

    fn weekday_name(i: &str) -> PResult<'_, &str> {
        take_while_m_n(3, 3, |c: char| c.is_ascii_alphabetic())(i)
    }

    fn digits<'a>(n: usize) -> impl Fn(&'a str) -> PResult<'a, &'a str> {
        move |i: &'a str| take_while_m_n(n, n, |c: char| c.is_ascii_digit())(i)
    }

}

pub mod token {
    use serde::{Deserialize, Serialize};
    use std::fmt;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum TokenKind {
        Headline,
        Keyword,
        Comment,
        Agenda,
        BlockBegin,
        BlockEnd,
        Section,
    }

    impl TokenKind {
        pub fn as_str(self) -> &'static str {
            match self {
                TokenKind::Headline => "headline",
                TokenKind::Keyword => "keyword",
                TokenKind::Comment => "comment",
                TokenKind::Agenda => "agenda",
                TokenKind::BlockBegin => "block_begin",
                TokenKind::BlockEnd => "block_end",
                TokenKind::Section => "section",
            }
        }
    }

    impl fmt::Display for TokenKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// One classified input line.
    ///
    /// `count` is the number of logical items the matcher found on the line; the
    /// length of `values` is a function of `kind` and `count` (five per item for
    /// agenda tokens) and builders validate it before use.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Token {
        kind: TokenKind,
        count: usize,
        values: Vec<String>,
    }

    impl Token {
        pub fn new(kind: TokenKind, count: usize, values: Vec<String>) -> Self {
            Self {
                kind,
                count,
                values,
            }
        }

        pub fn kind(&self) -> TokenKind {
            self.kind
        }

        pub fn count(&self) -> usize {
            self.count
        }

        pub fn values(&self) -> &[String] {
            &self.values
        }
    }
}

pub mod lexer {
    //! Line matchers and the tokenizer that applies them.
    //!
    //! Every matcher looks at exactly one line. Multi-line constructs (blocks,
    //! paragraphs) are reassembled by the parser.

    use crate::error::TokenizeError;
    use crate::token::{Token, TokenKind};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{is_not, tag, tag_no_case, take_while_m_n, take_while1},
        character::complete::{alpha1, char, digit1, multispace0, multispace1, one_of, satisfy},
        combinator::{opt, recognize, rest},
        error::VerboseError,
        sequence::{preceded, tuple},
    };
    use std::io::BufRead;

    /// A line matcher: returns a token when it recognizes the line.
    pub type LexFn = fn(&str) -> Option<Token>;

    /// Precedence order. Block markers sit ahead of keywords and comments because
    /// `#+begin_src bash :x` also reads as a keyword and `#+end_src` as a comment.
    pub const DEFAULT_LEX_FNS: &[LexFn] = &[
        lex_headline, // * <keyword> <priority> <title> <tags>
        lex_block,    // #+begin_<name> <params> / #+end_<name>
        lex_keyword,  // #+<key>: <value>
        lex_comment,  // # <comment>
        lex_agenda,   // <KEY>: <timestamp>
        lex_section,  // anything else
    ];

    /// Planning lines carry at most one stamp per agenda key.
    const MAX_AGENDA_ITEMS: usize = 3;

    #[derive(Debug, Clone)]
    pub struct Tokenizer {
        lex_fns: Vec<LexFn>,
    }

    impl Default for Tokenizer {
        fn default() -> Self {
            Self::new(DEFAULT_LEX_FNS.to_vec())
        }
    }

    impl Tokenizer {
        pub fn new(lex_fns: Vec<LexFn>) -> Self {
            Self { lex_fns }
        }

        /// Classify every line of `input`, failing on the first line no matcher accepts.
        pub fn tokenize<R: BufRead>(&self, input: R) -> Result<Vec<Token>, TokenizeError> {
            let mut tokens = Vec::new();
            for (idx, line) in input.lines().enumerate() {
                let line = line?;
                let line_no = idx + 1;
                let Some(token) = self.lex_line(&line) else {
                    return Err(TokenizeError::NoMatch { line_no, line });
                };
                tracing::trace!(line_no, kind = %token.kind(), "lexed line");
                tokens.push(token);
            }
            tracing::debug!(tokens = tokens.len(), "tokenized input");
            Ok(tokens)
        }

        pub fn tokenize_str(&self, input: &str) -> Result<Vec<Token>, TokenizeError> {
            self.tokenize(input.as_bytes())
        }

        pub fn lex_line(&self, line: &str) -> Option<Token> {
            self.lex_fns.iter().find_map(|lex| lex(line))
        }
    }

    /* ------------------------------- Matchers ------------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn single(kind: TokenKind, values: &[&str]) -> Token {
        Token::new(kind, 1, values.iter().map(|v| v.to_string()).collect())
    }

    fn is_word_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_'
    }

    pub fn lex_headline(line: &str) -> Option<Token> {
        let (_, (stars, title)) = headline(line).ok()?;
        Some(single(TokenKind::Headline, &[stars, title]))
    }

    fn headline(i: &str) -> PResult<'_, (&str, &str)> {
        let (i, stars) = take_while1(|c: char| c == '*')(i)?;
        let (i, _) = multispace1(i)?;
        Ok(("", (stars, i)))
    }

    pub fn lex_block(line: &str) -> Option<Token> {
        if let Ok((_, (name, params))) = block_begin(line) {
            return Some(single(TokenKind::BlockBegin, &[name, params]));
        }
        let (_, name) = block_end(line).ok()?;
        Some(single(TokenKind::BlockEnd, &[name]))
    }

    fn block_begin(i: &str) -> PResult<'_, (&str, &str)> {
        let (i, _) = multispace0(i)?;
        let (i, _) = tag_no_case("#+begin_")(i)?;
        let (i, name) = take_while1(is_word_char)(i)?;
        let (i, params) = opt(preceded(multispace1, rest))(i)?;
        Ok((i, (name, params.unwrap_or(""))))
    }

    fn block_end(i: &str) -> PResult<'_, &str> {
        let (i, _) = multispace0(i)?;
        let (i, _) = tag_no_case("#+end_")(i)?;
        take_while1(is_word_char)(i)
    }

    pub fn lex_keyword(line: &str) -> Option<Token> {
        let (_, (key, value)) = keyword(line).ok()?;
        Some(single(TokenKind::Keyword, &[key, value]))
    }

    fn keyword(i: &str) -> PResult<'_, (&str, &str)> {
        // #+key: value
        let (i, _) = multispace0(i)?;
        let (i, _) = tag("#+")(i)?;
        let (i, key) = is_not(":")(i)?;
        let (i, _) = char(':')(i)?;
        let (i, _) = multispace0(i)?;
        Ok(("", (key, i)))
    }

    pub fn lex_comment(line: &str) -> Option<Token> {
        let (_, message) = comment(line).ok()?;
        Some(single(TokenKind::Comment, &[message]))
    }

    fn comment(i: &str) -> PResult<'_, &str> {
        let (i, _) = multispace0(i)?;
        let (i, _) = char('#')(i)?;
        let (i, _) = multispace0(i)?;
        Ok(("", i))
    }

    /// Collects up to three `KEY: <stamp>` items found anywhere on the line.
    pub fn lex_agenda(line: &str) -> Option<Token> {
        let mut values = Vec::new();
        let mut count = 0;
        let mut cursor = line;
        while count < MAX_AGENDA_ITEMS && !cursor.is_empty() {
            match agenda_item(cursor) {
                Ok((rest, item)) => {
                    values.extend(item.iter().map(|v| v.to_string()));
                    count += 1;
                    cursor = rest;
                }
                Err(_) => {
                    let mut chars = cursor.chars();
                    chars.next();
                    cursor = chars.as_str();
                }
            }
        }
        (count > 0).then(|| Token::new(TokenKind::Agenda, count, values))
    }

    /// `KEY: [YYYY-MM-DD Www HH:MM +1w]` with weekday, time and interval optional.
    fn agenda_item(i: &str) -> PResult<'_, [&str; 5]> {
        let (i, key) = alt((tag("CLOSED"), tag("DEADLINE"), tag("SCHEDULED")))(i)?;
        let (i, _) = char(':')(i)?;
        let (i, _) = satisfy(|c| matches!(c, ' ' | '\t' | '\r' | '\n' | '\x0C'))(i)?;
        let (i, _) = one_of("[<")(i)?;
        let (i, date) = recognize(tuple((
            digits(4),
            char('-'),
            digits(2),
            char('-'),
            digits(2),
        )))(i)?;
        let (i, _) = opt(char(' '))(i)?;
        let (i, weekday) = opt(alpha1)(i)?;
        let (i, _) = opt(char(' '))(i)?;
        let (i, time) = opt(recognize(tuple((digits(2), char(':'), digits(2)))))(i)?;
        let (i, _) = opt(char(' '))(i)?;
        let (i, interval) = opt(recognize(tuple((char('+'), digit1, one_of("dwmy")))))(i)?;
        let (i, _) = one_of("]>")(i)?;
        Ok((
            i,
            [
                key,
                date,
                weekday.unwrap_or(""),
                time.unwrap_or(""),
                interval.unwrap_or(""),
            ],
        ))
    }

    fn digits<'a>(n: usize) -> impl Fn(&'a str) -> PResult<'a, &'a str> {
        move |i: &'a str| take_while_m_n(n, n, |c: char| c.is_ascii_digit())(i)
    }

    /// Fallback: accepts every line, blank ones included.
    pub fn lex_section(line: &str) -> Option<Token> {
        Some(single(TokenKind::Section, &[line.trim()]))
    }

}

pub mod node {
    //! Renderable document elements.

    use crate::error::RenderError;
    use crate::timestamp::Timestamp;
    use crate::writer::{WriteOptions, escape_html};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::borrow::Cow;
    use std::fmt;
    use std::io::Write;
    use std::str::FromStr;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum Node {
        Headline(Headline),
        Keyword(Keyword),
        Comment(Comment),
        Agenda(Agenda),
        Block(Block),
        SourceBlock(SourceBlock),
        Section(Section),
    }

    impl Node {
        pub fn write_html<W: Write + ?Sized>(
            &self,
            w: &mut W,
            opts: &WriteOptions,
        ) -> Result<(), RenderError> {
            match self {
                Node::Headline(n) => n.write_html(w, opts),
                Node::Keyword(_) => Ok(()),
                Node::Comment(n) => n.write_html(w, opts),
                Node::Agenda(n) => n.write_html(w, opts),
                Node::Block(n) => n.write_html(w, opts),
                Node::SourceBlock(n) => n.write_html(w, opts),
                Node::Section(n) => n.write_html(w, opts),
            }
        }
    }

    fn text<'a>(s: &'a str, opts: &WriteOptions) -> Cow<'a, str> {
        if opts.escape_html {
            escape_html(s)
        } else {
            Cow::Borrowed(s)
        }
    }

    /* ------------------------------- Headline ------------------------------- */

    /// `** TODO [#A] Title :tag1:tag2:`
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Headline {
        /// Number of leading `*`.
        pub depth: usize,
        pub keyword: Option<String>,
        pub priority: Option<String>,
        pub title: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub tags: Vec<String>,
    }

    impl Headline {
        /// Tags are parsed but not rendered.
        pub fn write_html<W: Write + ?Sized>(
            &self,
            w: &mut W,
            opts: &WriteOptions,
        ) -> Result<(), RenderError> {
            if self.depth == 0 {
                return Err(RenderError::HeadlineDepth {
                    title: self.title.clone(),
                });
            }
            if self.title.is_empty() {
                return Err(RenderError::EmptyTitle { depth: self.depth });
            }
            writeln!(w, "<h{} class=\"org-headline\">", self.depth)?;
            if let Some(keyword) = &self.keyword {
                writeln!(
                    w,
                    "<span class=\"hl-kwd kwd-{}\">{}</span>",
                    text(&keyword.to_lowercase(), opts),
                    text(keyword, opts)
                )?;
            }
            if let Some(priority) = &self.priority {
                writeln!(
                    w,
                    "<span class=\"hl-pri pri-{}\">{}</span>",
                    text(&priority.to_lowercase(), opts),
                    text(priority, opts)
                )?;
            }
            writeln!(w, "{}", text(&self.title, opts))?;
            writeln!(w, "</h{}>", self.depth)?;
            Ok(())
        }
    }

    /* --------------------------- Keyword & Comment --------------------------- */

    /// Affiliated keyword (`#+KEY: value`). Metadata only; renders nothing.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Keyword {
        pub key: String,
        pub value: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Comment {
        pub message: String,
    }

    impl Comment {
        pub fn write_html<W: Write + ?Sized>(
            &self,
            w: &mut W,
            opts: &WriteOptions,
        ) -> Result<(), RenderError> {
            if !self.message.is_empty() {
                writeln!(w, "<!-- {} -->", text(&self.message, opts))?;
            }
            Ok(())
        }
    }

    /* -------------------------------- Agenda -------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum AgendaKey {
        Closed,
        Deadline,
        Scheduled,
    }

    impl AgendaKey {
        pub fn as_str(self) -> &'static str {
            match self {
                AgendaKey::Closed => "CLOSED",
                AgendaKey::Deadline => "DEADLINE",
                AgendaKey::Scheduled => "SCHEDULED",
            }
        }
    }

    impl fmt::Display for AgendaKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl FromStr for AgendaKey {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s {
                "CLOSED" => Ok(AgendaKey::Closed),
                "DEADLINE" => Ok(AgendaKey::Deadline),
                "SCHEDULED" => Ok(AgendaKey::Scheduled),
                other => Err(format!("unknown agenda key {other:?}")),
            }
        }
    }

    /// Planning line: one timestamp per key, later stamps on the line overwrite
    /// earlier ones. Iterates in first-seen key order.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Agenda {
        pub logs: IndexMap<AgendaKey, Timestamp>,
    }

    impl Agenda {
        pub fn get(&self, key: AgendaKey) -> Option<&Timestamp> {
            self.logs.get(&key)
        }

        pub fn write_html<W: Write + ?Sized>(
            &self,
            w: &mut W,
            opts: &WriteOptions,
        ) -> Result<(), RenderError> {
            if self.logs.is_empty() {
                return Ok(());
            }
            writeln!(w, "<div class=\"org-agenda\">")?;
            for (key, stamp) in &self.logs {
                let mut display = stamp.to_string();
                if !stamp.interval.is_empty() {
                    display.push(' ');
                    display.push_str(&stamp.interval);
                }
                writeln!(
                    w,
                    "<span class=\"agenda-{}\">{}: <time datetime=\"{}\">{}</time></span>",
                    key.as_str().to_lowercase(),
                    key,
                    stamp.iso(),
                    text(&display, opts)
                )?;
            }
            writeln!(w, "</div>")?;
            Ok(())
        }
    }

    /* -------------------------------- Blocks -------------------------------- */

    /// `#+begin_NAME` … `#+end_NAME`, name stored uppercased.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Block {
        pub name: String,
        pub content: String,
    }

    impl Block {
        pub fn write_html<W: Write + ?Sized>(
            &self,
            w: &mut W,
            opts: &WriteOptions,
        ) -> Result<(), RenderError> {
            writeln!(
                w,
                "<div class=\"org-block block-{}\">",
                text(&self.name.to_lowercase(), opts)
            )?;
            writeln!(w, "{}", text(&self.content, opts))?;
            writeln!(w, "</div>")?;
            Ok(())
        }
    }

    /// `#+begin_src LANG :prop a :prop b`
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SourceBlock {
        pub language: String,
        pub source: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub properties: Vec<String>,
    }

    impl SourceBlock {
        pub fn write_html<W: Write + ?Sized>(
            &self,
            w: &mut W,
            opts: &WriteOptions,
        ) -> Result<(), RenderError> {
            let language = text(&self.language, opts);
            writeln!(w, "<div class=\"org-block block-src\">")?;
            writeln!(
                w,
                "<code class=\"block lang-{language}\" data-lang=\"{language}\">"
            )?;
            writeln!(w, "{}", text(&self.source, opts))?;
            writeln!(w, "</code>")?;
            writeln!(w, "</div>")?;
            Ok(())
        }
    }

    /* ------------------------------- Section ------------------------------- */

    /// Plain text; each paragraph is a run of non-blank lines joined by spaces.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Section {
        pub paragraphs: Vec<String>,
    }

    impl Section {
        pub fn write_html<W: Write + ?Sized>(
            &self,
            w: &mut W,
            opts: &WriteOptions,
        ) -> Result<(), RenderError> {
            for paragraph in &self.paragraphs {
                writeln!(w, "<p>{}</p>", text(paragraph, opts))?;
            }
            Ok(())
        }
    }

    macro_rules! impl_from_variant {
        ($($variant:ident),* $(,)?) => {
            $(
                impl From<$variant> for Node {
                    fn from(value: $variant) -> Self {
                        Node::$variant(value)
                    }
                }
            )*
        };
    }

    impl_from_variant!(Headline, Keyword, Comment, Agenda, Block, SourceBlock, Section);

}

pub mod parser {
    //! Token stream to node sequence.
    //!
    //! The parser dispatches on the kind of the current token to a builder
    //! registered at construction. A builder reads the shared token slice from
    //! its start index, may look ahead, and reports how many tokens it consumed
    //! together with the node it built (or none).

    use crate::error::ParseError;
    use crate::node::{
        Agenda, AgendaKey, Block, Comment, Headline, Keyword, Node, Section, SourceBlock,
    };
    use crate::timestamp::{parse_datestamp, parse_timestamp};
    use crate::token::{Token, TokenKind};
    use indexmap::IndexMap;
    use nom::{
        IResult,
        bytes::complete::{tag, take_while1},
        character::complete::{char, multispace1},
        combinator::opt,
        error::VerboseError,
        sequence::{delimited, terminated},
    };
    use std::collections::HashMap;

    /// Block name that switches on source-block handling.
    pub const SOURCE_BLOCK_NAME: &str = "SRC";

    /// key, date, weekday, time, interval
    const AGENDA_COLUMNS: usize = 5;

    /// Outcome of one builder call.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Parsed {
        pub consumed: usize,
        pub node: Option<Node>,
    }

    impl Parsed {
        pub fn node(consumed: usize, node: impl Into<Node>) -> Self {
            Self {
                consumed,
                node: Some(node.into()),
            }
        }

        pub fn skip(consumed: usize) -> Self {
            Self {
                consumed,
                node: None,
            }
        }
    }

    /// Builds a node starting at `tokens[index]`.
    pub type ParseFn = fn(&[Token], usize) -> Result<Parsed, ParseError>;

    #[derive(Debug, Clone)]
    pub struct Parser {
        parse_fns: HashMap<TokenKind, ParseFn>,
    }

    impl Default for Parser {
        fn default() -> Self {
            Self::new(Self::default_parse_fns())
        }
    }

    impl Parser {
        pub fn new(parse_fns: HashMap<TokenKind, ParseFn>) -> Self {
            Self { parse_fns }
        }

        /// Builders for every supported construct. Block ends have none: they are
        /// consumed by the block builder, so a stray one is an unknown token.
        pub fn default_parse_fns() -> HashMap<TokenKind, ParseFn> {
            HashMap::from([
                (TokenKind::Headline, parse_headline as ParseFn),
                (TokenKind::Keyword, parse_keyword as ParseFn),
                (TokenKind::Comment, parse_comment as ParseFn),
                (TokenKind::Agenda, parse_agenda as ParseFn),
                (TokenKind::BlockBegin, parse_block as ParseFn),
                (TokenKind::Section, parse_section as ParseFn),
            ])
        }

        pub fn parse(&self, tokens: &[Token]) -> Result<Vec<Node>, ParseError> {
            let mut nodes = Vec::new();
            let mut i = 0;
            while i < tokens.len() {
                let kind = tokens[i].kind();
                let parse_fn = self
                    .parse_fns
                    .get(&kind)
                    .ok_or(ParseError::UnknownKind { index: i, kind })?;
                let Parsed { consumed, node } = parse_fn(tokens, i)?;
                tracing::trace!(index = i, kind = %kind, consumed, "built node");
                if consumed == 0 {
                    return Err(ParseError::NoProgress { index: i, kind });
                }
                nodes.extend(node);
                i += consumed;
            }
            tracing::debug!(tokens = tokens.len(), nodes = nodes.len(), "parsed tokens");
            Ok(nodes)
        }
    }

    fn value_count(token: &Token, index: usize, expected: &'static str) -> ParseError {
        ParseError::ValueCount {
            index,
            kind: token.kind(),
            expected,
            got: token.values().len(),
        }
    }

    /* ------------------------------- Headline ------------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    struct HeadlineData<'a> {
        keyword: Option<&'a str>,
        priority: Option<&'a str>,
        title: &'a str,
        tags: Vec<&'a str>,
    }

    pub fn parse_headline(tokens: &[Token], i: usize) -> Result<Parsed, ParseError> {
        let token = &tokens[i];
        let [stars, rest, ..] = token.values() else {
            return Err(value_count(token, i, "at least 2"));
        };
        let (_, data) = headline_data(rest).map_err(|_| ParseError::HeadlineFormat {
            index: i,
            title: rest.clone(),
        })?;
        let headline = Headline {
            depth: stars.chars().count(),
            keyword: data.keyword.map(str::to_string),
            priority: data.priority.map(str::to_string),
            title: data.title.to_string(),
            tags: data.tags.into_iter().map(str::to_string).collect(),
        };
        Ok(Parsed::node(1, headline))
    }

    /// `[KEYWORD ][[#P] ]title[ :tag1:tag2:]`
    fn headline_data(i: &str) -> PResult<'_, HeadlineData<'_>> {
        let (i, keyword) = opt(terminated(
            take_while1(|c: char| c.is_ascii_uppercase()),
            multispace1,
        ))(i)?;
        let (i, priority) = opt(terminated(
            delimited(
                tag("[#"),
                take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
                char(']'),
            ),
            multispace1,
        ))(i)?;
        let (title, tags) = split_tags(i);
        Ok((
            "",
            HeadlineData {
                keyword,
                priority,
                title,
                tags,
            },
        ))
    }

    fn is_tag_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '#' | '%')
    }

    /// Splits a trailing `:a:b:` run (preceded by whitespace) off the title.
    fn split_tags(text: &str) -> (&str, Vec<&str>) {
        let trimmed = text.trim_end();
        let run_start = trimmed
            .char_indices()
            .rev()
            .find(|(_, c)| !(is_tag_char(*c) || *c == ':'))
            .map(|(pos, c)| pos + c.len_utf8())
            .unwrap_or(0);
        let (before, run) = trimmed.split_at(run_start);
        let is_tag_run = run.len() >= 3
            && run.starts_with(':')
            && run.ends_with(':')
            && before.ends_with(char::is_whitespace);
        if !is_tag_run {
            return (trimmed, Vec::new());
        }
        let tags = run[1..run.len() - 1]
            .split(':')
            .filter(|t| !t.is_empty())
            .collect();
        (before.trim_end(), tags)
    }

    /* --------------------------- Keyword & Comment --------------------------- */

    pub fn parse_keyword(tokens: &[Token], i: usize) -> Result<Parsed, ParseError> {
        let token = &tokens[i];
        let [key, value] = token.values() else {
            return Err(value_count(token, i, "2"));
        };
        let key = key.to_uppercase();
        if key.is_empty() {
            return Err(ParseError::EmptyKeywordKey { index: i });
        }
        Ok(Parsed::node(
            1,
            Keyword {
                key,
                value: value.trim().to_string(),
            },
        ))
    }

    /// Empty comments are consumed without producing a node.
    pub fn parse_comment(tokens: &[Token], i: usize) -> Result<Parsed, ParseError> {
        let token = &tokens[i];
        let Some(message) = token.values().first() else {
            return Err(value_count(token, i, "any"));
        };
        if message.is_empty() {
            return Ok(Parsed::skip(1));
        }
        Ok(Parsed::node(
            1,
            Comment {
                message: message.clone(),
            },
        ))
    }

    /* -------------------------------- Agenda -------------------------------- */

    pub fn parse_agenda(tokens: &[Token], i: usize) -> Result<Parsed, ParseError> {
        let token = &tokens[i];
        let values = token.values();
        if token.count() * AGENDA_COLUMNS != values.len() {
            return Err(ParseError::AgendaShape {
                index: i,
                count: token.count(),
                values: values.len(),
            });
        }

        let mut logs = IndexMap::with_capacity(token.count());
        for group in values.chunks_exact(AGENDA_COLUMNS) {
            let (key, date, weekday, time, interval) =
                (&group[0], &group[1], &group[2], &group[3], &group[4]);
            let key_text = key.to_uppercase();
            let key: AgendaKey = key_text
                .parse()
                .map_err(|_| ParseError::AgendaKey { index: i, key: key_text })?;
            let stamp = if time.is_empty() {
                parse_datestamp(&format!("{date} {weekday}"), interval)
            } else {
                parse_timestamp(&format!("{date} {weekday} {time}"), interval)
            }
            .map_err(|source| ParseError::Timestamp { index: i, source })?;
            // Same key again on the line: keep the slot, take the later stamp.
            logs.insert(key, stamp);
        }
        Ok(Parsed::node(1, Agenda { logs }))
    }

    /* -------------------------------- Blocks -------------------------------- */

    pub fn parse_block(tokens: &[Token], start: usize) -> Result<Parsed, ParseError> {
        let begin = &tokens[start];
        let [name, params] = begin.values() else {
            return Err(value_count(begin, start, "2"));
        };
        let name = name.to_uppercase();
        if name.is_empty() {
            return Err(ParseError::EmptyBlockName { index: start });
        }

        let mut content = String::new();
        let mut end = None;
        for (idx, token) in tokens.iter().enumerate().skip(start + 1) {
            let Some(first) = token.values().first() else {
                return Err(value_count(token, idx, "at least 1"));
            };
            if token.kind() == TokenKind::BlockEnd {
                let got = first.to_uppercase();
                if got != name {
                    return Err(ParseError::BlockMismatch {
                        index: idx,
                        got,
                        want: name,
                    });
                }
                end = Some(idx);
                break;
            }
            content.push_str(first);
            content.push('\n');
        }
        let Some(end) = end else {
            return Err(ParseError::UnterminatedBlock { index: start, name });
        };
        let consumed = end - start + 1;
        let content = content.trim_end_matches('\n').to_string();

        if name != SOURCE_BLOCK_NAME {
            return Ok(Parsed::node(consumed, Block { name, content }));
        }
        let (language, properties) = source_params(params);
        Ok(Parsed::node(
            consumed,
            SourceBlock {
                language,
                source: content,
                properties,
            },
        ))
    }

    /// `bash :var x=2 :results output` → (`bash`, [`var x=2`, `results output`])
    fn source_params(params: &str) -> (String, Vec<String>) {
        let params = params.trim();
        let (language, rest) = params
            .split_once(char::is_whitespace)
            .unwrap_or((params, ""));
        let rest = rest.trim();
        let rest = rest.strip_prefix(':').unwrap_or(rest);
        let properties = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split(" :").map(|p| p.trim().to_string()).collect()
        };
        (language.to_string(), properties)
    }

    /* ------------------------------- Section ------------------------------- */

    fn flush_paragraph(current: &mut String, paragraphs: &mut Vec<String>) {
        if !current.is_empty() {
            paragraphs.push(std::mem::take(current));
        }
    }

    pub fn parse_section(tokens: &[Token], start: usize) -> Result<Parsed, ParseError> {
        let mut paragraphs = Vec::new();
        let mut current = String::new();
        let mut i = start;
        while let Some(token) = tokens.get(i).filter(|t| t.kind() == TokenKind::Section) {
            let Some(line) = token.values().first() else {
                return Err(value_count(token, i, "any"));
            };
            i += 1;
            if line.is_empty() {
                flush_paragraph(&mut current, &mut paragraphs);
                continue;
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(line);
        }
        flush_paragraph(&mut current, &mut paragraphs);
        Ok(Parsed::node(i - start, Section { paragraphs }))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::lexer::Tokenizer;
        use crate::timestamp::{parse_datestamp, parse_timestamp};

        fn tok(kind: TokenKind, count: usize, values: &[&str]) -> Token {
            Token::new(kind, count, values.iter().map(|v| v.to_string()).collect())
        }

        fn parse_one(f: ParseFn, tokens: &[Token]) -> Parsed {
            f(tokens, 0).expect("parse")
        }

        #[test]
        fn parser_dispatches_and_advances() {
            let parser = Parser::new(HashMap::from([(
                TokenKind::Comment,
                parse_comment as ParseFn,
            )]));
            assert!(parser.parse(&[]).expect("empty").is_empty());

            let tokens = [
                tok(TokenKind::Comment, 1, &["one"]),
                tok(TokenKind::Comment, 1, &[""]),
                tok(TokenKind::Comment, 1, &["two"]),
            ];
            let nodes = parser.parse(&tokens).expect("nodes");
            assert_eq!(
                nodes,
                [
                    Node::Comment(Comment {
                        message: "one".into()
                    }),
                    Node::Comment(Comment {
                        message: "two".into()
                    }),
                ]
            );
        }

        #[test]
        fn parser_rejects_unknown_kind() {
            let parser = Parser::new(HashMap::new());
            let err = parser
                .parse(&[tok(TokenKind::Agenda, 1, &[])])
                .unwrap_err();
            assert!(matches!(
                err,
                ParseError::UnknownKind {
                    index: 0,
                    kind: TokenKind::Agenda
                }
            ));
            assert!(err.to_string().contains("kind=agenda"));

            let stray_end = Parser::default()
                .parse(&[tok(TokenKind::BlockEnd, 1, &["src"])])
                .unwrap_err();
            assert!(matches!(stray_end, ParseError::UnknownKind { .. }));
        }

        #[test]
        fn parser_rejects_builders_that_do_not_advance() {
            let parser = Parser::new(HashMap::from([(
                TokenKind::Comment,
                parse_section as ParseFn,
            )]));
            let err = parser
                .parse(&[tok(TokenKind::Comment, 1, &["x"])])
                .unwrap_err();
            assert!(matches!(err, ParseError::NoProgress { index: 0, .. }));
        }

        #[test]
        fn consumed_counts_cover_every_token() {
            let input = "#+TITLE: doc\n* TODO Head :a:\nSCHEDULED: <2022-01-30 Sun>\n\
                         para one\nstill one\n\npara two\n#+begin_quote\nq\n#+end_quote\n\
                         # note\n#\ntail\n";
            let tokens = Tokenizer::default().tokenize_str(input).expect("tokens");
            let parser = Parser::default();
            let mut i = 0;
            let mut total = 0;
            while i < tokens.len() {
                let f = parser.parse_fns[&tokens[i].kind()];
                let consumed = f(&tokens, i).expect("builder").consumed;
                assert!(consumed > 0);
                total += consumed;
                i += consumed;
            }
            assert_eq!(total, tokens.len());
        }

        #[test]
        fn headline_builder() {
            let err = parse_headline(&[tok(TokenKind::Headline, 1, &[])], 0).unwrap_err();
            assert_eq!(
                err.to_string(),
                "headline token[0] does not have at least 2 values: got=0"
            );

            let parsed = parse_one(
                parse_headline,
                &[tok(TokenKind::Headline, 1, &["*", "this is test headline"])],
            );
            assert_eq!(parsed.consumed, 1);
            assert_eq!(
                parsed.node,
                Some(Node::Headline(Headline {
                    depth: 1,
                    title: "this is test headline".into(),
                    ..Default::default()
                }))
            );

            let parsed = parse_one(
                parse_headline,
                &[tok(TokenKind::Headline, 1, &["****", "[#P1] this is test headline"])],
            );
            assert_eq!(
                parsed.node,
                Some(Node::Headline(Headline {
                    depth: 4,
                    priority: Some("P1".into()),
                    title: "this is test headline".into(),
                    ..Default::default()
                }))
            );

            let parsed = parse_one(
                parse_headline,
                &[tok(
                    TokenKind::Headline,
                    1,
                    &["*", "this is test headline      :test_tag1:@tag2:"],
                )],
            );
            assert_eq!(
                parsed.node,
                Some(Node::Headline(Headline {
                    depth: 1,
                    title: "this is test headline".into(),
                    tags: vec!["test_tag1".into(), "@tag2".into()],
                    ..Default::default()
                }))
            );
        }

        #[test]
        fn headline_tags_need_whitespace_and_end_of_line() {
            assert_eq!(split_tags("a :b: c :d:"), ("a :b: c", vec!["d"]));
            assert_eq!(split_tags("no:tags:"), ("no:tags:", vec![]));
            assert_eq!(split_tags("title :x:  "), ("title", vec!["x"]));
            assert_eq!(split_tags("title ::"), ("title ::", vec![]));
        }

        #[test]
        fn headline_scenario_from_source_text() {
            let tokens = Tokenizer::default()
                .tokenize_str("** DONE [#A] ship it :work:urgent:")
                .expect("tokens");
            let nodes = Parser::default().parse(&tokens).expect("nodes");
            assert_eq!(
                nodes,
                [Node::Headline(Headline {
                    depth: 2,
                    keyword: Some("DONE".into()),
                    priority: Some("A".into()),
                    title: "ship it".into(),
                    tags: vec!["work".into(), "urgent".into()],
                })]
            );
        }

        #[test]
        fn keyword_builder() {
            let parsed = parse_one(
                parse_keyword,
                &[tok(TokenKind::Keyword, 1, &["title", "  My Doc  "])],
            );
            assert_eq!(
                parsed.node,
                Some(Node::Keyword(Keyword {
                    key: "TITLE".into(),
                    value: "My Doc".into()
                }))
            );

            let err = parse_keyword(&[tok(TokenKind::Keyword, 1, &["", "x"])], 0).unwrap_err();
            assert!(matches!(err, ParseError::EmptyKeywordKey { index: 0 }));

            let err = parse_keyword(&[tok(TokenKind::Keyword, 1, &["a"])], 0).unwrap_err();
            assert_eq!(
                err.to_string(),
                "keyword token[0] does not have 2 values: got=1"
            );
        }

        #[test]
        fn comment_builder() {
            let err = parse_comment(&[tok(TokenKind::Comment, 1, &[])], 0).unwrap_err();
            assert_eq!(
                err.to_string(),
                "comment token[0] does not have any values: got=0"
            );
            assert_eq!(
                parse_one(parse_comment, &[tok(TokenKind::Comment, 1, &[""])]),
                Parsed::skip(1)
            );
            assert_eq!(
                parse_one(parse_comment, &[tok(TokenKind::Comment, 1, &["hi"])]).node,
                Some(Node::Comment(Comment {
                    message: "hi".into()
                }))
            );
        }

        #[test]
        fn agenda_builder() {
            let parsed = parse_one(
                parse_agenda,
                &[tok(
                    TokenKind::Agenda,
                    1,
                    &["CLOSED", "2022-01-30", "Sun", "10:03", ""],
                )],
            );
            assert_eq!(parsed.consumed, 1);
            let Some(Node::Agenda(agenda)) = parsed.node else {
                panic!("expected agenda");
            };
            assert_eq!(
                agenda.get(AgendaKey::Closed),
                Some(&parse_timestamp("2022-01-30 Sun 10:03", "").unwrap())
            );

            let parsed = parse_one(
                parse_agenda,
                &[tok(
                    TokenKind::Agenda,
                    2,
                    &[
                        "DEADLINE", "2022-01-30", "Sun", "", "", "SCHEDULED", "2022-01-30",
                        "Sun", "", "+1w",
                    ],
                )],
            );
            let Some(Node::Agenda(agenda)) = parsed.node else {
                panic!("expected agenda");
            };
            assert_eq!(agenda.logs.len(), 2);
            assert_eq!(
                agenda.get(AgendaKey::Scheduled),
                Some(&parse_datestamp("2022-01-30 Sun", "+1w").unwrap())
            );
        }

        #[test]
        fn agenda_builder_keeps_last_occurrence() {
            let parsed = parse_one(
                parse_agenda,
                &[tok(
                    TokenKind::Agenda,
                    3,
                    &[
                        "DEADLINE", "2022-01-30", "Sun", "", "", "CLOSED", "2022-01-31", "Mon",
                        "", "", "DEADLINE", "2022-02-01", "Tue", "09:00", "",
                    ],
                )],
            );
            let Some(Node::Agenda(agenda)) = parsed.node else {
                panic!("expected agenda");
            };
            let keys: Vec<_> = agenda.logs.keys().copied().collect();
            assert_eq!(keys, [AgendaKey::Deadline, AgendaKey::Closed]);
            assert_eq!(
                agenda.get(AgendaKey::Deadline),
                Some(&parse_timestamp("2022-02-01 Tue 09:00", "").unwrap())
            );
        }

        #[test]
        fn agenda_builder_errors() {
            let err = parse_agenda(&[tok(TokenKind::Agenda, 1, &[])], 0).unwrap_err();
            assert_eq!(
                err.to_string(),
                "agenda token[0] item number and its values are unmatched: num=1, vals=0"
            );

            let err = parse_agenda(
                &[tok(
                    TokenKind::Agenda,
                    1,
                    &["CLOSED", "2022-01-30", "Invalid", "10:04", "++2d"],
                )],
                0,
            )
            .unwrap_err();
            assert!(matches!(err, ParseError::Timestamp { index: 0, .. }));

            // Date-only failures propagate as well.
            let err = parse_agenda(
                &[tok(TokenKind::Agenda, 1, &["DEADLINE", "2022-01-30", "", "", ""])],
                0,
            )
            .unwrap_err();
            assert!(matches!(err, ParseError::Timestamp { .. }));

            let err = parse_agenda(
                &[tok(TokenKind::Agenda, 1, &["OPENED", "2022-01-30", "Sun", "", ""])],
                0,
            )
            .unwrap_err();
            assert!(matches!(err, ParseError::AgendaKey { .. }));
        }

        #[test]
        fn agenda_scenario_from_source_text() {
            let tokens = Tokenizer::default()
                .tokenize_str("    CLOSED: [2022-01-30 Sun 10:03] ")
                .expect("tokens");
            assert_eq!(
                tokens,
                [tok(
                    TokenKind::Agenda,
                    1,
                    &["CLOSED", "2022-01-30", "Sun", "10:03", ""]
                )]
            );
            let nodes = Parser::default().parse(&tokens).expect("nodes");
            let [Node::Agenda(agenda)] = nodes.as_slice() else {
                panic!("expected one agenda node, got {nodes:?}");
            };
            let closed = agenda.get(AgendaKey::Closed).expect("closed");
            assert!(!closed.date_only);
            assert_eq!(closed.to_string(), "2022-01-30 Sun 10:03");
        }

        #[test]
        fn block_builder_errors() {
            let err = parse_block(&[tok(TokenKind::BlockBegin, 1, &[])], 0).unwrap_err();
            assert_eq!(
                err.to_string(),
                "block_begin token[0] does not have 2 values: got=0"
            );

            let err = parse_block(&[tok(TokenKind::BlockBegin, 1, &["", ""])], 0).unwrap_err();
            assert!(matches!(err, ParseError::EmptyBlockName { index: 0 }));

            let err = parse_block(
                &[
                    tok(TokenKind::BlockBegin, 1, &["info", ""]),
                    tok(TokenKind::BlockEnd, 1, &["quote"]),
                ],
                0,
            )
            .unwrap_err();
            assert_eq!(
                err.to_string(),
                "token[1] is unexpected block end: got=QUOTE, want=INFO"
            );

            let err = parse_block(
                &[
                    tok(TokenKind::BlockBegin, 1, &["info", ""]),
                    tok(TokenKind::Section, 1, &["never closed"]),
                ],
                0,
            )
            .unwrap_err();
            assert!(matches!(err, ParseError::UnterminatedBlock { index: 0, .. }));
        }

        #[test]
        fn block_builder() {
            let parsed = parse_one(
                parse_block,
                &[
                    tok(TokenKind::BlockBegin, 1, &["info", ""]),
                    tok(TokenKind::BlockEnd, 1, &["Info"]),
                ],
            );
            assert_eq!(
                parsed,
                Parsed::node(
                    2,
                    Block {
                        name: "INFO".into(),
                        content: String::new()
                    }
                )
            );

            let parsed = parse_one(
                parse_block,
                &[
                    tok(TokenKind::BlockBegin, 1, &["QUOTE", ""]),
                    tok(TokenKind::Section, 1, &["hello"]),
                    tok(TokenKind::Section, 1, &["world"]),
                    tok(TokenKind::Section, 1, &[""]),
                    tok(TokenKind::BlockEnd, 1, &["QUOTE"]),
                    tok(TokenKind::Section, 1, &["after"]),
                ],
            );
            assert_eq!(
                parsed,
                Parsed::node(
                    5,
                    Block {
                        name: "QUOTE".into(),
                        content: "hello\nworld".into()
                    }
                )
            );
        }

        #[test]
        fn source_block_builder() {
            let parsed = parse_one(
                parse_block,
                &[
                    tok(TokenKind::BlockBegin, 1, &["SRC", "go  :var x=2  :var y=3"]),
                    tok(TokenKind::Section, 1, &["package main"]),
                    tok(TokenKind::Section, 1, &[""]),
                    tok(TokenKind::Section, 1, &["func main() { // noop }"]),
                    tok(TokenKind::BlockEnd, 1, &["SRC"]),
                ],
            );
            assert_eq!(
                parsed,
                Parsed::node(
                    5,
                    SourceBlock {
                        language: "go".into(),
                        source: "package main\n\nfunc main() { // noop }".into(),
                        properties: vec!["var x=2".into(), "var y=3".into()],
                    }
                )
            );

            assert_eq!(
                source_params("bash"),
                ("bash".to_string(), Vec::<String>::new())
            );
        }

        #[test]
        fn source_block_scenario_from_source_text() {
            let tokens = Tokenizer::default()
                .tokenize_str("#+begin_src bash :details t\necho hi\n#+end_src")
                .expect("tokens");
            let nodes = Parser::default().parse(&tokens).expect("nodes");
            assert_eq!(
                nodes,
                [Node::SourceBlock(SourceBlock {
                    language: "bash".into(),
                    source: "echo hi".into(),
                    properties: vec!["details t".into()],
                })]
            );
        }

        #[test]
        fn section_builder_splits_on_blank_lines() {
            let tokens = [
                tok(TokenKind::Section, 1, &["a."]),
                tok(TokenKind::Section, 1, &[""]),
                tok(TokenKind::Section, 1, &["b."]),
                tok(TokenKind::Section, 1, &["c."]),
                tok(TokenKind::Comment, 1, &["stop"]),
            ];
            assert_eq!(
                parse_one(parse_section, &tokens),
                Parsed::node(
                    4,
                    Section {
                        paragraphs: vec!["a.".into(), "b. c.".into()]
                    }
                )
            );

            let err = parse_section(&[tok(TokenKind::Section, 1, &[])], 0).unwrap_err();
            assert!(matches!(err, ParseError::ValueCount { index: 0, .. }));
        }

        #[test]
        fn block_name_matching_ignores_case() {
            let tokens = Tokenizer::default()
                .tokenize_str("#+BEGIN_Example\nx\n#+end_EXAMPLE")
                .expect("tokens");
            let nodes = Parser::default().parse(&tokens).expect("nodes");
            assert_eq!(
                nodes,
                [Node::Block(Block {
                    name: "EXAMPLE".into(),
                    content: "x".into()
                })]
            );

            let tokens = Tokenizer::default()
                .tokenize_str("#+begin_example\nx\n#+end_quote")
                .expect("tokens");
            let err = Parser::default().parse(&tokens).unwrap_err();
            let msg = err.to_string();
            assert!(msg.contains("EXAMPLE") && msg.contains("QUOTE"), "{msg}");
        }
    }
}

pub mod writer {
    //! Renders node sequences. Output is written as it goes; a failing node
    //! leaves everything before it in the sink.

    use crate::error::RenderError;
    use crate::node::Node;
    use std::borrow::Cow;
    use std::io::Write;

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct WriteOptions {
        /// Escape user text before embedding it. Off by default: text is written verbatim.
        pub escape_html: bool,
    }

    pub fn write_nodes<W: Write + ?Sized>(nodes: &[Node], out: &mut W) -> Result<(), RenderError> {
        write_nodes_with(nodes, out, &WriteOptions::default())
    }

    pub fn write_nodes_with<W: Write + ?Sized>(
        nodes: &[Node],
        out: &mut W,
        options: &WriteOptions,
    ) -> Result<(), RenderError> {
        for node in nodes {
            node.write_html(out, options)?;
        }
        tracing::debug!(nodes = nodes.len(), "rendered nodes");
        Ok(())
    }

    pub fn escape_html(s: &str) -> Cow<'_, str> {
        if !s.contains(|c| matches!(c, '&' | '<' | '>' | '"' | '\'')) {
            return Cow::Borrowed(s);
        }
        let mut out = String::with_capacity(s.len() + 16);
        for c in s.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#39;"),
                c => out.push(c),
            }
        }
        Cow::Owned(out)
    }

}

pub mod pipeline {
    //! Tokenizer, parser and writer wired together behind one facade.

    use crate::lexer::Tokenizer;
    use crate::node::Node;
    use crate::parser::Parser;
    use crate::token::Token;
    use crate::writer::{WriteOptions, write_nodes_with};
    use anyhow::{Context, Result};
    use std::{
        fs::File,
        io::{BufRead, BufReader, Write},
        path::Path,
    };

    #[derive(Debug, Clone, Default)]
    pub struct Pipeline {
        tokenizer: Tokenizer,
        parser: Parser,
        options: WriteOptions,
    }

    impl Pipeline {
        pub fn new(tokenizer: Tokenizer, parser: Parser, options: WriteOptions) -> Self {
            Self {
                tokenizer,
                parser,
                options,
            }
        }

        pub fn with_options(mut self, options: WriteOptions) -> Self {
            self.options = options;
            self
        }

        pub fn options(&self) -> &WriteOptions {
            &self.options
        }

        pub fn tokenize<R: BufRead>(&self, input: R) -> Result<Vec<Token>> {
            self.tokenizer.tokenize(input).context("tokenizing input")
        }

        pub fn parse<R: BufRead>(&self, input: R) -> Result<Vec<Node>> {
            let tokens = self.tokenize(input)?;
            self.parser.parse(&tokens).context("parsing tokens")
        }

        pub fn render<W: Write + ?Sized>(&self, nodes: &[Node], out: &mut W) -> Result<()> {
            write_nodes_with(nodes, out, &self.options).context("rendering nodes")
        }

        pub fn convert<R: BufRead, W: Write + ?Sized>(&self, input: R, out: &mut W) -> Result<()> {
            let nodes = self.parse(input)?;
            self.render(&nodes, out)
        }

        pub fn render_str(&self, input: &str) -> Result<String> {
            let mut out = Vec::new();
            self.convert(input.as_bytes(), &mut out)?;
            String::from_utf8(out).context("rendered output is not UTF-8")
        }

        pub fn tokenize_file(&self, path: &Path) -> Result<Vec<Token>> {
            let file = File::open(path).with_context(|| format!("opening {:?}", path))?;
            self.tokenize(BufReader::new(file))
                .with_context(|| format!("reading {:?}", path))
        }

        pub fn parse_file(&self, path: &Path) -> Result<Vec<Node>> {
            let file = File::open(path).with_context(|| format!("opening {:?}", path))?;
            self.parse(BufReader::new(file))
                .with_context(|| format!("parsing {:?}", path))
        }

        pub fn convert_file<W: Write + ?Sized>(&self, path: &Path, out: &mut W) -> Result<()> {
            let nodes = self.parse_file(path)?;
            self.render(&nodes, out)
                .with_context(|| format!("rendering {:?}", path))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const DOCUMENT: &str = r#"#+TITLE: Demo
# generated by hand
* TODO [#B] Write docs :docs:
  SCHEDULED: <2022-01-30 Sun +1w>
First line
continues here.

Second paragraph.
#+begin_src bash :details t
echo hi
#+end_src
#+BEGIN_QUOTE
quoted
#+END_QUOTE
"#;

        #[test]
        fn renders_document_end_to_end() {
            let html = Pipeline::default().render_str(DOCUMENT).expect("render");
            let expected = r#"<!-- generated by hand -->
<h1 class="org-headline">
<span class="hl-kwd kwd-todo">TODO</span>
<span class="hl-pri pri-b">B</span>
Write docs
</h1>
<div class="org-agenda">
<span class="agenda-scheduled">SCHEDULED: <time datetime="2022-01-30">2022-01-30 Sun +1w</time></span>
</div>
<p>First line continues here.</p>
<p>Second paragraph.</p>
<div class="org-block block-src">
<code class="block lang-bash" data-lang="bash">
echo hi
</code>
</div>
<div class="org-block block-quote">
quoted
</div>
"#;
            assert_eq!(html, expected);
        }

        #[test]
        fn escaping_applies_through_the_pipeline() {
            let pipeline = Pipeline::default().with_options(WriteOptions { escape_html: true });
            let html = pipeline.render_str("a <b> tag").expect("render");
            assert_eq!(html, "<p>a &lt;b&gt; tag</p>\n");
        }

        #[test]
        fn errors_carry_stage_context() {
            let err = Pipeline::default()
                .render_str("#+begin_src sh\necho\n")
                .unwrap_err();
            assert_eq!(err.to_string(), "parsing tokens");
            assert!(format!("{err:#}").contains("never closed"));
        }
    }
}

pub use lexer::Tokenizer;
pub use node::Node;
pub use parser::Parser;
pub use pipeline::Pipeline;
pub use token::{Token, TokenKind};
pub use writer::WriteOptions;

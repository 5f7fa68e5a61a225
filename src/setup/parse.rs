//! Option-token and chainsetup-file parsing primitives.
//!
//! Options are tokens of the form `-<prefix>[:arg1,arg2,...,argN]`. The
//! routines here implement the exact splitting rules the rest of the crate
//! (and saved chainsetup files) depend on:
//!
//! - the prefix is the substring between the first `-` and the first `:`;
//! - arguments are separated by unescaped commas; `\,` is a literal comma
//!   and the backslash is stripped from the final value;
//! - empty arguments are skipped;
//! - in chainsetup files, double quotes let a token span whitespace and a
//!   backslash escapes any single character.

/// Returns the prefix of an option token: the substring between the first
/// `-` and the first `:` (or the end of the token).
///
/// ```
/// use chain_audio::setup::parse::get_argument_prefix;
///
/// assert_eq!(get_argument_prefix("-ea:100"), "ea");
/// assert_eq!(get_argument_prefix("-z:db,100000"), "z");
/// assert_eq!(get_argument_prefix("-b"), "b");
/// ```
pub fn get_argument_prefix(option: &str) -> &str {
    let Some(dash) = option.find('-') else {
        return "";
    };
    let start = dash + 1;
    let end = option[start..]
        .find(':')
        .map_or(option.len(), |off| start + off);
    &option[start..end]
}

/// Finds the next `value` at or after `start` that is not preceded by a
/// backslash. Returns `chars.len()` when there is none.
fn find_next_unescaped(chars: &[char], start: usize, value: char) -> usize {
    let mut cursor = start;
    while cursor < chars.len() {
        match chars[cursor..].iter().position(|&c| c == value) {
            Some(offset) => {
                let pos = cursor + offset;
                if pos > 0 && chars[pos - 1] == '\\' {
                    cursor = pos + 1;
                    continue;
                }
                return pos;
            }
            None => return chars.len(),
        }
    }
    chars.len()
}

/// Splits the argument list of an option token.
///
/// Arguments start after the first `:`; if the token has no `:`, the whole
/// token is treated as the argument list. `\,` produces a literal comma,
/// empty arguments are dropped.
///
/// ```
/// use chain_audio::setup::parse::get_arguments;
///
/// assert_eq!(get_arguments("-i:a.wav"), vec!["a.wav"]);
/// assert_eq!(get_arguments("-x:foo\\,bar,baz"), vec!["foo,bar", "baz"]);
/// assert_eq!(get_arguments("-a:one,,two"), vec!["one", "two"]);
/// ```
pub fn get_arguments(option: &str) -> Vec<String> {
    let chars: Vec<char> = option.chars().collect();
    let mut result = Vec::new();

    let mut begin = match chars.iter().position(|&c| c == ':') {
        Some(pos) => pos + 1,
        None => {
            if chars.is_empty() {
                return result;
            }
            0
        }
    };

    while begin < chars.len() {
        let end = find_next_unescaped(&chars, begin, ',');
        let target: String = chars[begin..end].iter().collect();
        let target = target.replace("\\,", ",");
        if !target.is_empty() {
            result.push(target);
        }
        if end == chars.len() {
            break;
        }
        begin = end + 1;
    }

    result
}

/// Returns the `number`th argument (1-based) of an option token, or `None`
/// when there are fewer arguments.
pub fn get_argument_number(number: usize, option: &str) -> Option<String> {
    debug_assert!(number >= 1);
    let mut args = get_arguments(option);
    if number >= 1 && args.len() >= number {
        Some(args.swap_remove(number - 1))
    } else {
        None
    }
}

/// Escapes commas in an argument so that [`get_arguments`] reproduces the
/// original value. Inverse of the comma stripping, used when saving.
pub fn escape_argument(argument: &str) -> String {
    argument.replace(',', "\\,")
}

/// Splits a chainsetup-file line into tokens.
///
/// Whitespace separates tokens. Double quotes delimit a token spanning
/// whitespace (single quotes are ordinary characters). A backslash appends
/// the following character literally and never acts as a separator.
///
/// ```
/// use chain_audio::setup::parse::tokenize_quoted;
///
/// assert_eq!(
///     tokenize_quoted("a \"b c\" d\\ e"),
///     vec!["a", "b c", "d e"]
/// );
/// ```
pub fn tokenize_quoted(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == '\\' {
            if let Some(escaped) = chars.next() {
                current.push(escaped);
            }
        } else if !c.is_ascii_whitespace() || in_quotes {
            current.push(c);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

/// Extracts the option stream from chainsetup-file text: `#` lines are
/// comments, the rest is token-split and concatenated.
pub fn tokenize_setup_file(contents: &str) -> Vec<String> {
    let mut options = Vec::new();
    for line in contents.lines() {
        if line.starts_with('#') {
            continue;
        }
        options.extend(tokenize_quoted(line));
    }
    options
}

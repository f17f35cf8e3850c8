//! Parsing of opam-format manifests.
//!
//! Covers the subset of the opam file format the build core needs: `name`,
//! `version`, `build`, `install`, `patches` and `substs`. Other fields are
//! parsed and discarded. Command and patch filters (`{ ... }`) are preserved
//! as raw text; evaluating them is the builder's concern.

use super::{BuildManifest, BuildType, Command, CommandList, Patch};
use std::collections::HashMap;
use std::path::PathBuf;

/// Parse opam-format text into a normalized build manifest.
///
/// The package name is forced into the `@opam/` scope unless already there.
pub(super) fn parse(data: &str, name_fallback: Option<&str>) -> Result<BuildManifest, String> {
    let tokens = tokenize(data)?;
    let fields = parse_fields(&tokens)?;

    let name = fields
        .get("name")
        .map(|v| string_of(v))
        .transpose()?
        .or_else(|| name_fallback.map(str::to_string))
        .map(|n| coerce_opam_scope(&n));

    let version = fields.get("version").map(|v| string_of(v)).transpose()?;

    let build = fields.get("build").map(|v| commands_of(v)).transpose()?.unwrap_or_default();
    let install = fields.get("install").map(|v| commands_of(v)).transpose()?.unwrap_or_default();
    let patches = fields.get("patches").map(|v| patches_of(v)).transpose()?.unwrap_or_default();
    let substs = fields.get("substs").map(|v| substs_of(v)).transpose()?.unwrap_or_default();

    Ok(BuildManifest {
        name,
        version,
        build_type: BuildType::InSource,
        build: CommandList::Opam(build),
        install: CommandList::Opam(install),
        build_dev: None,
        exported_env: Default::default(),
        build_env: Default::default(),
        patches,
        substs,
    })
}

/// Prefix a package name with `@opam/` unless it already carries the scope.
pub fn coerce_opam_scope(name: &str) -> String {
    if name.starts_with("@opam/") {
        name.to_string()
    } else {
        format!("@opam/{}", name)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Colon,
    LBracket,
    RBracket,
    /// A `{ ... }` option block, captured verbatim without the braces.
    Filter(String),
}

/// Tokenizer over opam text. Handles `#` line comments, `(* *)` block
/// comments, quoted strings with escapes, and brace-delimited filter blocks.
fn tokenize(data: &str) -> Result<Vec<(usize, Token)>, String> {
    let mut tokens = Vec::new();
    let mut chars = data.char_indices().peekable();
    let mut line = 1usize;
    let bytes = data.as_bytes();

    while let Some(&(i, c)) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while let Some(&(_, c)) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '(' if bytes.get(i + 1) == Some(&b'*') => {
                chars.next();
                chars.next();
                let mut depth = 1usize;
                while depth > 0 {
                    match chars.next() {
                        Some((j, '(')) if bytes.get(j + 1) == Some(&b'*') => {
                            chars.next();
                            depth += 1;
                        }
                        Some((j, '*')) if bytes.get(j + 1) == Some(&b')') => {
                            chars.next();
                            depth -= 1;
                        }
                        Some((_, '\n')) => line += 1,
                        Some(_) => {}
                        None => return Err(format!("line {}: unterminated comment", line)),
                    }
                }
            }
            ':' => {
                tokens.push((line, Token::Colon));
                chars.next();
            }
            '[' => {
                tokens.push((line, Token::LBracket));
                chars.next();
            }
            ']' => {
                tokens.push((line, Token::RBracket));
                chars.next();
            }
            '{' => {
                chars.next();
                let mut depth = 1usize;
                let mut raw = String::new();
                loop {
                    match chars.next() {
                        Some((_, '{')) => {
                            depth += 1;
                            raw.push('{');
                        }
                        Some((_, '}')) => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                            raw.push('}');
                        }
                        Some((_, '\n')) => {
                            line += 1;
                            raw.push(' ');
                        }
                        Some((_, c)) => raw.push(c),
                        None => return Err(format!("line {}: unterminated filter", line)),
                    }
                }
                tokens.push((line, Token::Filter(raw.trim().to_string())));
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some((_, '\\')) => match chars.next() {
                            Some((_, 'n')) => s.push('\n'),
                            Some((_, 't')) => s.push('\t'),
                            Some((_, c)) => s.push(c),
                            None => return Err(format!("line {}: unterminated string", line)),
                        },
                        Some((_, '"')) => break,
                        Some((_, '\n')) => {
                            line += 1;
                            s.push('\n');
                        }
                        Some((_, c)) => s.push(c),
                        None => return Err(format!("line {}: unterminated string", line)),
                    }
                }
                tokens.push((line, Token::Str(s)));
            }
            c if is_ident_start(c) => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if is_ident_char(c) {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((line, Token::Ident(ident)));
            }
            other => return Err(format!("line {}: unexpected character {:?}", line, other)),
        }
    }

    Ok(tokens)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '%' || c == '.' || c == '/'
}

fn is_ident_char(c: char) -> bool {
    is_ident_start(c) || c == '-' || c == '+' || c == '!' || c == '?'
}

/// A parsed opam field value.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Ident(String),
    List(Vec<Value>),
    /// A value guarded by a `{ ... }` filter.
    Filtered(Box<Value>, String),
}

/// Parse the token stream as a sequence of `ident: value` fields.
fn parse_fields(tokens: &[(usize, Token)]) -> Result<HashMap<String, Value>, String> {
    let mut fields = HashMap::new();
    let mut pos = 0usize;

    while pos < tokens.len() {
        let (line, token) = &tokens[pos];
        let Token::Ident(name) = token else {
            return Err(format!("line {}: expected field name, found {:?}", line, token));
        };
        pos += 1;

        match tokens.get(pos) {
            Some((_, Token::Colon)) => pos += 1,
            other => {
                return Err(format!(
                    "line {}: expected ':' after field {:?}, found {:?}",
                    line, name, other
                ))
            }
        }

        let (value, next) = parse_value(tokens, pos)?;
        pos = next;
        fields.insert(name.clone(), value);
    }

    Ok(fields)
}

fn parse_value(tokens: &[(usize, Token)], pos: usize) -> Result<(Value, usize), String> {
    let (line, token) = tokens
        .get(pos)
        .ok_or_else(|| "unexpected end of input while reading a value".to_string())?;

    let (base, mut next) = match token {
        Token::Str(s) => (Value::Str(s.clone()), pos + 1),
        Token::Ident(i) => (Value::Ident(i.clone()), pos + 1),
        Token::LBracket => {
            let mut items = Vec::new();
            let mut cursor = pos + 1;
            loop {
                match tokens.get(cursor) {
                    Some((_, Token::RBracket)) => {
                        cursor += 1;
                        break;
                    }
                    Some(_) => {
                        let (item, after) = parse_value(tokens, cursor)?;
                        items.push(item);
                        cursor = after;
                    }
                    None => return Err(format!("line {}: unterminated list", line)),
                }
            }
            (Value::List(items), cursor)
        }
        other => return Err(format!("line {}: unexpected token {:?}", line, other)),
    };

    if let Some((_, Token::Filter(raw))) = tokens.get(next) {
        next += 1;
        return Ok((Value::Filtered(Box::new(base), raw.clone()), next));
    }

    Ok((base, next))
}

fn string_of(value: &Value) -> Result<String, String> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        Value::Ident(i) => Ok(i.clone()),
        Value::Filtered(inner, _) => string_of(inner),
        Value::List(_) => Err("expected a string, found a list".to_string()),
    }
}

/// Interpret a field value as a command list.
///
/// `build: [make]` is a single command; `build: [[make] [make "install"]]`
/// is a list of commands, each optionally filtered.
fn commands_of(value: &Value) -> Result<Vec<Command>, String> {
    match value {
        Value::List(items) if items.iter().any(|i| matches!(unfiltered(i), Value::List(_))) => {
            items.iter().map(command_of).collect()
        }
        Value::List(_) | Value::Str(_) | Value::Ident(_) | Value::Filtered(..) => {
            let cmd = command_of(value)?;
            if cmd.args.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![cmd])
            }
        }
    }
}

fn command_of(value: &Value) -> Result<Command, String> {
    match value {
        Value::Filtered(inner, filter) => {
            let mut cmd = command_of(inner)?;
            cmd.filter = Some(filter.clone());
            Ok(cmd)
        }
        Value::List(items) => {
            let args = items.iter().map(string_of).collect::<Result<Vec<_>, _>>()?;
            Ok(Command::new(args))
        }
        Value::Str(_) | Value::Ident(_) => Ok(Command::new([string_of(value)?])),
    }
}

fn unfiltered(value: &Value) -> &Value {
    match value {
        Value::Filtered(inner, _) => unfiltered(inner),
        other => other,
    }
}

fn patches_of(value: &Value) -> Result<Vec<Patch>, String> {
    let items = match value {
        Value::List(items) => items.as_slice(),
        other => std::slice::from_ref(other),
    };

    items
        .iter()
        .map(|item| match item {
            Value::Filtered(inner, filter) => Ok(Patch {
                path: PathBuf::from(string_of(inner)?),
                filter: Some(filter.clone()),
            }),
            other => Ok(Patch { path: PathBuf::from(string_of(other)?), filter: None }),
        })
        .collect()
}

fn substs_of(value: &Value) -> Result<Vec<PathBuf>, String> {
    let items = match value {
        Value::List(items) => items.as_slice(),
        other => std::slice::from_ref(other),
    };

    items.iter().map(|item| Ok(PathBuf::from(string_of(item)?))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
opam-version: "2.0"
name: "ocamlfind"
version: "1.9.6"
# toolchain for library discovery
build: [
  ["./configure" "-bindir" "%{bin}%" "-sitelib" "%{lib}%"]
  [make "all"]
  [make "opt"] { ocaml:native }
]
install: [make "install"]
patches: ["ldconf.patch" "no-awk.patch" { os = "macos" }]
substs: ["Makefile.config.in"]
"#;

    #[test]
    fn test_parse_sample() {
        let manifest = parse(SAMPLE, None).unwrap();

        assert_eq!(manifest.name.as_deref(), Some("@opam/ocamlfind"));
        assert_eq!(manifest.version.as_deref(), Some("1.9.6"));
        assert_eq!(manifest.build_type, BuildType::InSource);

        let build = manifest.build.commands();
        assert_eq!(build.len(), 3);
        assert_eq!(build[0].args, vec!["./configure", "-bindir", "%{bin}%", "-sitelib", "%{lib}%"]);
        assert_eq!(build[1].args, vec!["make", "all"]);
        assert_eq!(build[2].filter.as_deref(), Some("ocaml:native"));

        assert_eq!(manifest.install.commands(), &[Command::new(["make", "install"])]);

        assert_eq!(manifest.patches.len(), 2);
        assert_eq!(manifest.patches[0].path, PathBuf::from("ldconf.patch"));
        assert!(manifest.patches[0].filter.is_none());
        assert_eq!(manifest.patches[1].filter.as_deref(), Some("os = \"macos\""));

        assert_eq!(manifest.substs, vec![PathBuf::from("Makefile.config.in")]);
    }

    #[test]
    fn test_scope_coercion() {
        let manifest = parse("name: \"foo\"\n", None).unwrap();
        assert_eq!(manifest.name.as_deref(), Some("@opam/foo"));

        let scoped = parse("name: \"@opam/foo\"\n", None).unwrap();
        assert_eq!(scoped.name.as_deref(), Some("@opam/foo"));
    }

    #[test]
    fn test_name_fallback_is_scoped() {
        let manifest = parse("opam-version: \"2.0\"\n", Some("dune")).unwrap();
        assert_eq!(manifest.name.as_deref(), Some("@opam/dune"));
    }

    #[test]
    fn test_single_command_field() {
        let manifest = parse("build: [make]\n", None).unwrap();
        assert_eq!(manifest.build.commands(), &[Command::new(["make"])]);
    }

    #[test]
    fn test_missing_fields_default_empty() {
        let manifest = parse("opam-version: \"2.0\"\n", None).unwrap();
        assert!(manifest.is_noop());
        assert!(manifest.patches.is_empty());
        assert!(manifest.substs.is_empty());
    }

    #[test]
    fn test_comments_are_skipped() {
        let text = "(* header (* nested *) *)\nname: \"x\" # trailing\n";
        let manifest = parse(text, None).unwrap();
        assert_eq!(manifest.name.as_deref(), Some("@opam/x"));
    }

    #[test]
    fn test_unterminated_string_is_an_error() {
        assert!(parse("name: \"oops\n", None).is_err());
    }
}

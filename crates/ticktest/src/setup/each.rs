use std::iter::Peekable;
use std::str::Chars;

use serde::Serialize;
use serde_json::{Map, Value};

/// Names for each `.each` row, formatted from `template`. When every row
/// serializes to an array its elements become separate arguments; otherwise
/// each row is a single argument.
pub(crate) fn expand_rows<T: Serialize>(rows: &[T], template: &str) -> Result<Vec<String>, String> {
    if rows.is_empty() {
        return Err(".each called with no data".to_string());
    }
    let values = rows
        .iter()
        .map(|row| {
            serde_json::to_value(row).map_err(|error| format!("cannot serialize .each row: {error}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let spread = values.iter().all(Value::is_array);
    values
        .into_iter()
        .map(|value| {
            let args = match value {
                Value::Array(items) if spread => items,
                other => vec![other],
            };
            format_name(template, &args)
        })
        .collect()
}

/// printf-style substitution supporting `%s %q %d %i %x %X %f %%` with the
/// `-0+ #` flags, a field width and a precision.
fn format_name(template: &str, args: &[Value]) -> Result<String, String> {
    let mut output = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next_arg = 0usize;
    while let Some(ch) = chars.next() {
        if ch != '%' {
            output.push(ch);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            output.push('%');
            continue;
        }
        let directive = Directive::parse(&mut chars)?;
        let Some(conversion) = chars.next() else {
            return Err("invalid conversion '%' to 'format'".to_string());
        };
        next_arg += 1;
        let position = next_arg;
        let arg = args
            .get(position - 1)
            .ok_or_else(|| bad_argument(position, "no value"))?;
        let field = match conversion {
            's' => {
                let text = display_value(arg);
                let text = match directive.precision {
                    Some(max) => text.chars().take(max).collect(),
                    None => text,
                };
                directive.pad("", &text, false)
            }
            'q' => quote(&display_value(arg)),
            'd' | 'i' => {
                let value = integer_arg(arg, position)?;
                let mut digits = value.unsigned_abs().to_string();
                if let Some(min) = directive.precision {
                    digits = format!("{digits:0>min$}");
                }
                directive.pad(directive.sign(value < 0), &digits, directive.precision.is_none())
            }
            'x' | 'X' => {
                let value = integer_arg(arg, position)?;
                let mut digits = if conversion == 'x' {
                    format!("{value:x}")
                } else {
                    format!("{value:X}")
                };
                if let Some(min) = directive.precision {
                    digits = format!("{digits:0>min$}");
                }
                let prefix = match (directive.alternate && value != 0, conversion) {
                    (true, 'x') => "0x",
                    (true, _) => "0X",
                    (false, _) => "",
                };
                directive.pad(prefix, &digits, directive.precision.is_none())
            }
            'f' => {
                let number = float_arg(arg, position)?;
                let digits = format!("{:.*}", directive.precision.unwrap_or(6), number.abs());
                directive.pad(directive.sign(number < 0.0), &digits, number.is_finite())
            }
            other => return Err(format!("invalid conversion '%{other}' to 'format'")),
        };
        output.push_str(&field);
    }
    Ok(output)
}

/// Flags, width and precision of one conversion.
#[derive(Debug, Default, Clone, Copy)]
struct Directive {
    left_align: bool,
    zero_pad: bool,
    plus_sign: bool,
    space_sign: bool,
    alternate: bool,
    width: usize,
    precision: Option<usize>,
}

impl Directive {
    fn parse(chars: &mut Peekable<Chars<'_>>) -> Result<Self, String> {
        let mut directive = Self::default();
        while let Some(flag) = chars.peek().copied() {
            let slot = match flag {
                '-' => &mut directive.left_align,
                '0' => &mut directive.zero_pad,
                '+' => &mut directive.plus_sign,
                ' ' => &mut directive.space_sign,
                '#' => &mut directive.alternate,
                _ => break,
            };
            if *slot {
                return Err("invalid format (repeated flags)".to_string());
            }
            *slot = true;
            chars.next();
        }
        directive.width = read_number(chars)?.unwrap_or(0);
        if chars.peek() == Some(&'.') {
            chars.next();
            directive.precision = Some(read_number(chars)?.unwrap_or(0));
        }
        Ok(directive)
    }

    fn sign(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.plus_sign {
            "+"
        } else if self.space_sign {
            " "
        } else {
            ""
        }
    }

    /// Pads to the field width; zero padding goes between `prefix` and `body`.
    fn pad(&self, prefix: &str, body: &str, numeric: bool) -> String {
        let fill = self
            .width
            .saturating_sub(prefix.chars().count() + body.chars().count());
        if self.left_align {
            format!("{prefix}{body}{}", " ".repeat(fill))
        } else if self.zero_pad && numeric {
            format!("{prefix}{}{body}", "0".repeat(fill))
        } else {
            format!("{}{prefix}{body}", " ".repeat(fill))
        }
    }
}

/// At most two digits, as for C format widths.
fn read_number(chars: &mut Peekable<Chars<'_>>) -> Result<Option<usize>, String> {
    let mut digits = String::new();
    while let Some(digit) = chars.peek().copied().filter(char::is_ascii_digit) {
        digits.push(digit);
        chars.next();
    }
    if digits.len() > 2 {
        return Err("invalid format (width or precision too long)".to_string());
    }
    Ok(digits.parse().ok())
}

fn bad_argument(position: usize, detail: &str) -> String {
    format!("bad argument #{} to 'format' ({detail})", position + 1)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) | Value::Object(_) => "table",
    }
}

fn integer_arg(value: &Value, position: usize) -> Result<i64, String> {
    let Value::Number(number) = value else {
        return Err(bad_argument(
            position,
            &format!("number expected, got {}", type_name(value)),
        ));
    };
    if let Some(integer) = number.as_i64() {
        return Ok(integer);
    }
    match number.as_f64() {
        Some(float) if float.fract() == 0.0 && float.abs() < i64::MAX as f64 => Ok(float as i64),
        _ => Err(bad_argument(position, "number has no integer representation")),
    }
}

fn float_arg(value: &Value, position: usize) -> Result<f64, String> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| bad_argument(position, "number expected, got number")),
        other => Err(bad_argument(
            position,
            &format!("number expected, got {}", type_name(other)),
        )),
    }
}

/// How a value reads inside a test name. Tables use the one-line structural
/// form, e.g. `{prop = "value"}`.
fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => render_line(other),
    }
}

fn render_line(value: &Value) -> String {
    match value {
        Value::Null => "nil".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => quote(text),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(render_line).collect();
            format!("{{{}}}", items.join(", "))
        }
        Value::Object(map) => render_object(map),
    }
}

fn render_object(map: &Map<String, Value>) -> String {
    let entries: Vec<String> = map
        .iter()
        .map(|(key, value)| {
            if is_identifier(key) {
                format!("{key} = {}", render_line(value))
            } else {
                format!("[{}] = {}", quote(key), render_line(value))
            }
        })
        .collect();
    format!("{{{}}}", entries.join(", "))
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|ch| ch == '_' || ch.is_ascii_alphanumeric())
}

fn quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for ch in text.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\0' => quoted.push_str("\\0"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn scalar_rows_become_single_arguments() {
        let names = expand_rows(&[1, 2, 3], "n=%d").expect("expand");
        assert_eq!(names, vec!["n=1", "n=2", "n=3"]);
    }

    #[test]
    fn array_rows_are_spread() {
        let names = expand_rows(&[(1, 2, 3), (4, 5, 6)], "%d, %d, %d").expect("expand");
        assert_eq!(names, vec!["1, 2, 3", "4, 5, 6"]);
        let mixed = expand_rows(&[json!([1, 2]), json!(3)], "%s").expect("expand");
        assert_eq!(mixed, vec!["{1, 2}", "3"]);
    }

    #[test]
    fn tables_render_structurally() {
        let names = expand_rows(&[json!({ "prop": "value" })], "%s").expect("expand");
        assert_eq!(names, vec!["{prop = \"value\"}"]);
        assert_eq!(
            display_value(&json!({ "two words": [1, null, true] })),
            "{[\"two words\"] = {1, nil, true}}"
        );
    }

    #[test]
    fn conversions_match_printf() {
        let args = [json!(255), json!(1.5), json!("a\"b")];
        assert_eq!(
            format_name("%x %.2f %q 100%%", &args).expect("format"),
            "ff 1.50 \"a\\\"b\" 100%"
        );
        assert_eq!(format_name("%f", &[json!(2)]).expect("format"), "2.000000");
    }

    #[test]
    fn bad_arguments_are_errors() {
        let empty: [u8; 0] = [];
        assert_eq!(
            expand_rows(&empty, "%s").expect_err("empty"),
            ".each called with no data"
        );
        assert_eq!(
            format_name("%d", &[json!("x")]).expect_err("string"),
            "bad argument #2 to 'format' (number expected, got string)"
        );
        assert_eq!(
            format_name("%d %d", &[json!(1)]).expect_err("missing"),
            "bad argument #3 to 'format' (no value)"
        );
        assert_eq!(
            format_name("%d", &[json!(1.5)]).expect_err("fraction"),
            "bad argument #2 to 'format' (number has no integer representation)"
        );
    }

    #[test]
    fn widths_and_flags_pad_fields() {
        assert_eq!(format_name("[%5d]", &[json!(42)]).expect("width"), "[   42]");
        assert_eq!(format_name("[%-3s]", &[json!("a")]).expect("left"), "[a  ]");
        assert_eq!(format_name("[%05.1f]", &[json!(2.5)]).expect("zero"), "[002.5]");
        assert_eq!(format_name("[%05d]", &[json!(-7)]).expect("sign"), "[-0007]");
        assert_eq!(format_name("[%+d]", &[json!(3)]).expect("plus"), "[+3]");
        assert_eq!(format_name("[%#x]", &[json!(255)]).expect("alt"), "[0xff]");
        assert_eq!(format_name("[%.3d]", &[json!(5)]).expect("digits"), "[005]");
        assert_eq!(format_name("[%.2s]", &[json!("abc")]).expect("cut"), "[ab]");
    }

    #[test]
    fn malformed_directives_are_errors() {
        assert_eq!(
            format_name("%100d", &[json!(1)]).expect_err("wide"),
            "invalid format (width or precision too long)"
        );
        assert_eq!(
            format_name("%--d", &[json!(1)]).expect_err("repeated"),
            "invalid format (repeated flags)"
        );
        assert_eq!(
            format_name("%y", &[json!(1)]).expect_err("unknown"),
            "invalid conversion '%y' to 'format'"
        );
    }
}

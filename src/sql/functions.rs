/// Built-in scalar function library
///
/// Names arrive uppercased from the dispatcher. Returns Ok(None) for names
/// this library does not know, which the dispatcher maps to Null.
use chrono::{Datelike, Local, Utc};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::types::{ColumnType, Value};

pub fn call_builtin(name: &str, args: &[Value]) -> Result<Option<Value>> {
    let v = match name {
        // ---- string ----
        "UPPER" | "UCASE" => text1(name, args, |s| Value::Text(s.to_uppercase()))?,
        "LOWER" | "LCASE" => text1(name, args, |s| Value::Text(s.to_lowercase()))?,
        "LEN" | "LENGTH" => text1(name, args, |s| Value::Int(s.chars().count() as i64))?,
        "TRIM" => text1(name, args, |s| Value::Text(s.trim().to_string()))?,
        "LTRIM" => text1(name, args, |s| Value::Text(s.trim_start().to_string()))?,
        "RTRIM" => text1(name, args, |s| Value::Text(s.trim_end().to_string()))?,
        "REVERSE" => text1(name, args, |s| Value::Text(s.chars().rev().collect()))?,
        "CONCAT" => {
            // nulls concatenate as empty
            Value::Text(args.iter().map(Value::render).collect())
        }
        "CONCAT_WS" => {
            need_at_least(name, args, 1)?;
            if args[0].is_null() {
                return Ok(Some(Value::Null));
            }
            let sep = args[0].render();
            let parts: Vec<String> = args[1..]
                .iter()
                .filter(|a| !a.is_null())
                .map(Value::render)
                .collect();
            Value::Text(parts.join(&sep))
        }
        "REPLACE" => {
            need(name, args, 3)?;
            if args.iter().any(Value::is_null) {
                return Ok(Some(Value::Null));
            }
            Value::Text(args[0].render().replace(&args[1].render(), &args[2].render()))
        }
        "SUBSTRING" | "SUBSTR" | "MID" => {
            need_between(name, args, 2, 3)?;
            if args[0].is_null() || args[1].is_null() {
                return Ok(Some(Value::Null));
            }
            let s = args[0].render();
            let start = (args[1].to_i64().max(1) - 1) as usize;
            let taken: String = match args.get(2) {
                Some(len) if !len.is_null() => {
                    s.chars().skip(start).take(len.to_i64().max(0) as usize).collect()
                }
                _ => s.chars().skip(start).collect(),
            };
            Value::Text(taken)
        }
        "LEFT" => {
            need(name, args, 2)?;
            if args[0].is_null() || args[1].is_null() {
                return Ok(Some(Value::Null));
            }
            let n = args[1].to_i64().max(0) as usize;
            Value::Text(args[0].render().chars().take(n).collect())
        }
        "RIGHT" => {
            need(name, args, 2)?;
            if args[0].is_null() || args[1].is_null() {
                return Ok(Some(Value::Null));
            }
            let s: Vec<char> = args[0].render().chars().collect();
            let n = (args[1].to_i64().max(0) as usize).min(s.len());
            Value::Text(s[s.len() - n..].iter().collect())
        }
        "CHARINDEX" | "LOCATE" | "INSTR" => {
            need_between(name, args, 2, 3)?;
            if args[0].is_null() || args[1].is_null() {
                return Ok(Some(Value::Null));
            }
            let needle = args[0].render().to_lowercase();
            let hay: Vec<char> = args[1].render().to_lowercase().chars().collect();
            let from = args
                .get(2)
                .map(|v| (v.to_i64().max(1) - 1) as usize)
                .unwrap_or(0);
            Value::Int(find_chars(&hay, &needle.chars().collect::<Vec<_>>(), from))
        }
        "PATINDEX" => {
            need(name, args, 2)?;
            if args[0].is_null() || args[1].is_null() {
                return Ok(Some(Value::Null));
            }
            Value::Int(patindex(&args[0].render(), &args[1].render()))
        }
        "REPLICATE" | "REPEAT" => {
            need(name, args, 2)?;
            if args[0].is_null() || args[1].is_null() {
                return Ok(Some(Value::Null));
            }
            Value::Text(args[0].render().repeat(args[1].to_i64().max(0) as usize))
        }
        "SPACE" => {
            need(name, args, 1)?;
            if args[0].is_null() {
                return Ok(Some(Value::Null));
            }
            Value::Text(" ".repeat(args[0].to_i64().max(0) as usize))
        }
        "STR" | "TOSTRING" | "TO_CHAR" => {
            need(name, args, 1)?;
            if args[0].is_null() {
                return Ok(Some(Value::Null));
            }
            Value::Text(args[0].render())
        }
        "ASCII" => {
            need(name, args, 1)?;
            match args[0].render().chars().next() {
                Some(c) => Value::Int(c as i64),
                None => Value::Null,
            }
        }
        "CHAR" => {
            need(name, args, 1)?;
            if args[0].is_null() {
                return Ok(Some(Value::Null));
            }
            match char::from_u32(args[0].to_i64().max(0) as u32) {
                Some(c) => Value::Text(c.to_string()),
                None => Value::Null,
            }
        }

        // ---- numeric ----
        "ABS" => num1(name, args, |v| match v {
            Value::Int(i) => Value::Int(i.abs()),
            other => Value::Float(other.to_f64().abs()),
        })?,
        "ROUND" => {
            need_between(name, args, 1, 2)?;
            if args[0].is_null() {
                return Ok(Some(Value::Null));
            }
            let digits = args.get(1).map(|v| v.to_i64()).unwrap_or(0);
            let factor = 10f64.powi(digits as i32);
            let rounded = (args[0].to_f64() * factor).round() / factor;
            match args[0] {
                Value::Int(_) if digits >= 0 => Value::Int(rounded as i64),
                _ => Value::Float(rounded),
            }
        }
        "FLOOR" => num1(name, args, |v| match v {
            Value::Int(i) => Value::Int(*i),
            other => Value::Float(other.to_f64().floor()),
        })?,
        "CEILING" | "CEIL" => num1(name, args, |v| match v {
            Value::Int(i) => Value::Int(*i),
            other => Value::Float(other.to_f64().ceil()),
        })?,
        "POWER" | "POW" => {
            need(name, args, 2)?;
            if args[0].is_null() || args[1].is_null() {
                return Ok(Some(Value::Null));
            }
            Value::Float(args[0].to_f64().powf(args[1].to_f64()))
        }
        "SQRT" => num1(name, args, |v| Value::Float(v.to_f64().sqrt()))?,
        "EXP" => num1(name, args, |v| Value::Float(v.to_f64().exp()))?,
        "LOG" | "LN" => {
            need_between(name, args, 1, 2)?;
            if args[0].is_null() {
                return Ok(Some(Value::Null));
            }
            match args.get(1) {
                Some(base) if !base.is_null() => {
                    Value::Float(args[0].to_f64().log(base.to_f64()))
                }
                _ => Value::Float(args[0].to_f64().ln()),
            }
        }
        "LOG10" => num1(name, args, |v| Value::Float(v.to_f64().log10()))?,
        "SIGN" => num1(name, args, |v| {
            let f = v.to_f64();
            Value::Int(if f > 0.0 {
                1
            } else if f < 0.0 {
                -1
            } else {
                0
            })
        })?,
        "MOD" => {
            need(name, args, 2)?;
            if args[0].is_null() || args[1].is_null() {
                return Ok(Some(Value::Null));
            }
            if args[1].to_f64() == 0.0 {
                return Err(EngineError::DivisionByZero);
            }
            match (&args[0], &args[1]) {
                (Value::Int(a), Value::Int(b)) => Value::Int(a % b),
                (a, b) => Value::Float(a.to_f64() % b.to_f64()),
            }
        }
        "RAND" | "RANDOM" => Value::Float(rand::random::<f64>()),
        "PI" => Value::Float(std::f64::consts::PI),

        // ---- null handling ----
        "COALESCE" | "NVL" | "IFNULL" | "ISNULL" => args
            .iter()
            .find(|a| !a.is_null())
            .cloned()
            .unwrap_or(Value::Null),
        "NULLIF" => {
            need(name, args, 2)?;
            if args[0].sql_eq(&args[1]) {
                Value::Null
            } else {
                args[0].clone()
            }
        }

        // ---- date ----
        "NOW" | "GETDATE" | "CURRENT_TIMESTAMP" => {
            Value::Timestamp(Local::now().naive_local())
        }
        "GETUTCDATE" | "UTC_TIMESTAMP" => Value::Timestamp(Utc::now().naive_utc()),
        "YEAR" => date_part(name, args, |t| t.year() as i64)?,
        "MONTH" => date_part(name, args, |t| t.month() as i64)?,
        "DAY" => date_part(name, args, |t| t.day() as i64)?,
        "DATEDIFF" => {
            need(name, args, 3)?;
            if args.iter().any(Value::is_null) {
                return Ok(Some(Value::Null));
            }
            let part = args[0].render().to_uppercase();
            let d1 = as_timestamp(&args[1])?;
            let d2 = as_timestamp(&args[2])?;
            let seconds = (d2 - d1).num_seconds();
            let diff = match part.as_str() {
                "YEAR" => (d2.year() - d1.year()) as i64,
                "MONTH" => {
                    (d2.year() - d1.year()) as i64 * 12 + (d2.month() as i64 - d1.month() as i64)
                }
                "DAY" => (d2.date() - d1.date()).num_days(),
                "HOUR" => seconds / 3600,
                "MINUTE" => seconds / 60,
                "SECOND" => seconds,
                other => {
                    return Err(EngineError::InvalidArgument(format!(
                        "DATEDIFF: unknown part {}",
                        other
                    )))
                }
            };
            Value::Int(diff)
        }

        // ---- flow ----
        "IIF" | "IF" => {
            need(name, args, 3)?;
            if args[0].truthy() {
                args[1].clone()
            } else {
                args[2].clone()
            }
        }
        "NEWID" | "UUID" | "NEWGUID" => Value::Uuid(Uuid::new_v4()),

        _ => return Ok(None),
    };
    Ok(Some(v))
}

fn need(name: &str, args: &[Value], n: usize) -> Result<()> {
    if args.len() != n {
        return Err(EngineError::InvalidArgument(format!(
            "{}() takes {} argument(s), got {}",
            name,
            n,
            args.len()
        )));
    }
    Ok(())
}

fn need_between(name: &str, args: &[Value], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        return Err(EngineError::InvalidArgument(format!(
            "{}() takes {} to {} arguments, got {}",
            name,
            min,
            max,
            args.len()
        )));
    }
    Ok(())
}

fn need_at_least(name: &str, args: &[Value], min: usize) -> Result<()> {
    if args.len() < min {
        return Err(EngineError::InvalidArgument(format!(
            "{}() takes at least {} argument(s)",
            name, min
        )));
    }
    Ok(())
}

fn text1(name: &str, args: &[Value], f: impl Fn(&str) -> Value) -> Result<Value> {
    need(name, args, 1)?;
    if args[0].is_null() {
        return Ok(Value::Null);
    }
    Ok(f(&args[0].render()))
}

fn num1(name: &str, args: &[Value], f: impl Fn(&Value) -> Value) -> Result<Value> {
    need(name, args, 1)?;
    if args[0].is_null() {
        return Ok(Value::Null);
    }
    Ok(f(&args[0]))
}

fn date_part(name: &str, args: &[Value], f: impl Fn(&chrono::NaiveDateTime) -> i64) -> Result<Value> {
    need(name, args, 1)?;
    if args[0].is_null() {
        return Ok(Value::Null);
    }
    Ok(Value::Int(f(&as_timestamp(&args[0])?)))
}

fn as_timestamp(v: &Value) -> Result<chrono::NaiveDateTime> {
    match v.coerce_to(ColumnType::Timestamp)? {
        Value::Timestamp(t) => Ok(t),
        _ => Err(EngineError::TypeMismatch("expected a timestamp".into())),
    }
}

/// 1-based char position of `needle` in `hay` starting at `from`, 0 if absent.
fn find_chars(hay: &[char], needle: &[char], from: usize) -> i64 {
    if needle.is_empty() || needle.len() > hay.len() {
        return 0;
    }
    for i in from..=hay.len() - needle.len() {
        if hay[i..i + needle.len()] == *needle {
            return (i + 1) as i64;
        }
    }
    0
}

/// PATINDEX: 1-based position where the LIKE pattern core first matches,
/// 0 when it does not. Surrounding `%` wildcards are stripped before the
/// unanchored search.
fn patindex(pattern: &str, text: &str) -> i64 {
    let core = pattern.trim_matches('%');
    let mut regex_text = String::from("(?i)");
    for ch in core.chars() {
        match ch {
            '%' => regex_text.push_str(".*"),
            '_' => regex_text.push('.'),
            c => regex_text.push_str(&regex::escape(&c.to_string())),
        }
    }
    match regex::Regex::new(&regex_text) {
        Ok(re) => match re.find(text) {
            Some(m) => (text[..m.start()].chars().count() + 1) as i64,
            None => 0,
        },
        Err(_) => 0,
    }
}

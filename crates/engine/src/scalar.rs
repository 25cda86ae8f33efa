//! Plain-scalar classification.
//!
//! Given the text of a plain scalar, decide what it is under a schema:
//! null literal, boolean literal, infinity/NaN spelling, integer, float,
//! or — the fallback that never fails — a string. Quoted scalars never
//! reach this module; the decoder forces them to strings.
//!
//! The literal tables and number syntaxes are the wire-compatibility
//! surface for YAML 1.1, YAML 1.2 (failsafe/core/json) and JSON, so the
//! tests here are bit-exact oracles.

use loam_core::{Kind, Value};

use crate::builder::Builder;

/// Scalar resolution rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schema {
    /// Resolved later (a decoder adopts the document's schema); behaves
    /// as YAML 1.2 core when used directly.
    #[default]
    Auto,
    /// YAML 1.2 failsafe: every scalar is a string.
    V12Failsafe,
    /// YAML 1.2 core.
    V12Core,
    /// YAML 1.2 JSON schema.
    V12Json,
    /// YAML 1.1.
    V11,
    /// Plain JSON.
    Json,
}

impl Schema {
    pub fn name(self) -> &'static str {
        match self {
            Schema::Auto => "auto",
            Schema::V12Failsafe => "yaml-1.2-failsafe",
            Schema::V12Core => "yaml-1.2-core",
            Schema::V12Json => "yaml-1.2-json",
            Schema::V11 => "yaml-1.1",
            Schema::Json => "json",
        }
    }

    fn json_family(self) -> bool {
        matches!(self, Schema::V12Json | Schema::Json)
    }
}

/// Classify `text` under `schema`, building the scalar with `b`.
///
/// `force` pins the result kind: `String` skips classification
/// entirely; any other kind turns a mismatched result into
/// [`Value::INVALID`].
pub fn scalar_from_text(b: &Builder, text: &str, schema: Schema, force: Option<Kind>) -> Value {
    if force == Some(Kind::String) {
        return b.str_of(text);
    }
    let schema = match schema {
        Schema::Auto => Schema::V12Core,
        s => s,
    };
    let parsed = classify(b, text, schema);
    match force {
        None => parsed,
        Some(kind) if parsed.kind() == kind => parsed,
        Some(_) => Value::INVALID,
    }
}

/// What `text` would classify as, without building anything. Emitters
/// use this to decide whether a plain string needs quoting.
pub fn classify_kind(text: &str, schema: Schema) -> Kind {
    let schema = match schema {
        Schema::Auto => Schema::V12Core,
        s => s,
    };
    if schema == Schema::V12Failsafe {
        return Kind::String;
    }
    if is_null(text, schema) {
        return Kind::Null;
    }
    if bool_literal(text, schema).is_some() {
        return Kind::Bool;
    }
    if special_float(text, schema).is_some() || parse_float(text, schema).is_some() {
        if parse_int(text, schema).is_some() {
            return Kind::Int;
        }
        return Kind::Float;
    }
    if parse_int(text, schema).is_some() {
        return Kind::Int;
    }
    Kind::String
}

fn classify(b: &Builder, text: &str, schema: Schema) -> Value {
    if schema == Schema::V12Failsafe {
        return b.str_of(text);
    }
    if is_null(text, schema) {
        return Value::NULL;
    }
    if let Some(v) = bool_literal(text, schema) {
        return Value::bool_of(v);
    }
    if let Some(f) = special_float(text, schema) {
        return b.float_of(f);
    }
    if let Some(i) = parse_int(text, schema) {
        return b.int_of(i);
    }
    if let Some(d) = parse_float(text, schema) {
        return b.float_of(d);
    }
    b.str_of(text)
}

fn is_null(text: &str, schema: Schema) -> bool {
    if schema.json_family() {
        return text == "null";
    }
    matches!(text, "null" | "Null" | "NULL" | "~" | "")
}

fn bool_literal(text: &str, schema: Schema) -> Option<bool> {
    if schema.json_family() {
        return match text {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        };
    }
    match text {
        "true" | "True" | "TRUE" => Some(true),
        "false" | "False" | "FALSE" => Some(false),
        // The y/yes/on family is YAML 1.1 only.
        "y" | "Y" | "yes" | "Yes" | "YES" | "on" | "On" | "ON" if schema == Schema::V11 => {
            Some(true)
        }
        "n" | "N" | "no" | "No" | "NO" | "off" | "Off" | "OFF" if schema == Schema::V11 => {
            Some(false)
        }
        _ => None,
    }
}

fn special_float(text: &str, schema: Schema) -> Option<f64> {
    if schema.json_family() {
        return None;
    }
    match text {
        ".inf" | "+.inf" | ".Inf" | "+.Inf" | ".INF" | "+.INF" => Some(f64::INFINITY),
        "-.inf" | "-.Inf" | "-.INF" => Some(f64::NEG_INFINITY),
        ".nan" | ".NaN" | ".NAN" => Some(f64::NAN),
        _ => None,
    }
}

/// Integer syntax: optional sign (`+` is YAML-only), optional `0x`/`0o`
/// base prefix (YAML-only), digits in that base, nothing left over.
/// YAML 1.2 core has no bare-octal: `010` is decimal ten.
fn parse_int(text: &str, schema: Schema) -> Option<i64> {
    let bytes = text.as_bytes();
    let mut i = 0;
    let mut negative = false;
    match bytes.first() {
        Some(b'-') => {
            negative = true;
            i = 1;
        }
        Some(b'+') if !schema.json_family() => i = 1,
        _ => {}
    }
    let mut radix = 10u32;
    if !schema.json_family() && bytes.len() >= i + 2 && bytes[i] == b'0' {
        match bytes[i + 1] {
            b'x' | b'X' => {
                radix = 16;
                i += 2;
            }
            b'o' | b'O' => {
                radix = 8;
                i += 2;
            }
            _ => {}
        }
    }
    let digits = &text[i..];
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    let magnitude = u64::from_str_radix(digits, radix).ok()?;
    if negative {
        // |i64::MIN| is one past i64::MAX.
        if magnitude > (i64::MAX as u64) + 1 {
            return None;
        }
        Some((magnitude as i64).wrapping_neg())
    } else {
        i64::try_from(magnitude).ok()
    }
}

/// Float syntax: sign, decimal digits, optional `.` and fraction,
/// optional exponent. At least one digit overall, nothing left over.
fn parse_float(text: &str, schema: Schema) -> Option<f64> {
    let bytes = text.as_bytes();
    let mut i = 0;
    match bytes.first() {
        Some(b'-') => i = 1,
        Some(b'+') if !schema.json_family() => i = 1,
        _ => {}
    }
    let int_digits = count_digits(&bytes[i..]);
    i += int_digits;
    let mut frac_digits = 0;
    if bytes.get(i) == Some(&b'.') {
        i += 1;
        frac_digits = count_digits(&bytes[i..]);
        i += frac_digits;
    }
    if int_digits + frac_digits == 0 {
        return None;
    }
    if matches!(bytes.get(i), Some(b'e') | Some(b'E')) {
        i += 1;
        if matches!(bytes.get(i), Some(b'+') | Some(b'-')) {
            i += 1;
        }
        let exp_digits = count_digits(&bytes[i..]);
        if exp_digits == 0 {
            return None;
        }
        i += exp_digits;
    }
    if i != bytes.len() {
        return None;
    }
    // `+1.5` is outside Rust's grammar; the sign was validated above.
    text.trim_start_matches('+').parse::<f64>().ok()
}

fn count_digits(bytes: &[u8]) -> usize {
    bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::AutoScenario;

    fn builder() -> Builder {
        Builder::with_scenario(AutoScenario::PerTagFree, 64 * 1024).unwrap()
    }

    fn core(b: &Builder, text: &str) -> Value {
        scalar_from_text(b, text, Schema::V12Core, None)
    }

    #[test]
    fn test_core_schema_table() {
        let b = builder();
        assert_eq!(core(&b, "null"), Value::NULL);
        assert_eq!(core(&b, "~"), Value::NULL);
        assert_eq!(core(&b, ""), Value::NULL);
        assert_eq!(core(&b, "True").as_bool(), Some(true));
        assert_eq!(core(&b, "FALSE").as_bool(), Some(false));
        assert_eq!(unsafe { core(&b, "+.inf").as_float() }, Some(f64::INFINITY));
        assert_eq!(unsafe { core(&b, "-.inf").as_float() }, Some(f64::NEG_INFINITY));
        assert!(unsafe { core(&b, ".nan").as_float() }.unwrap().is_nan());
        assert_eq!(unsafe { core(&b, "0x10").as_int() }, Some(16));
        // No bare octal in core: leading zero is plain decimal.
        assert_eq!(unsafe { core(&b, "010").as_int() }, Some(10));
        assert_eq!(unsafe { core(&b, "0o10").as_int() }, Some(8));
        assert_eq!(unsafe { core(&b, "1.5e2").as_float() }, Some(150.0));
        assert_eq!(unsafe { core(&b, "+42").as_int() }, Some(42));
        assert_eq!(unsafe { core(&b, "-17").as_int() }, Some(-17));
    }

    #[test]
    fn test_core_fallbacks_to_string() {
        let b = builder();
        for text in ["yes", "on", "hello", "0x", "1.2.3", "1e", "--3", ".", "+"] {
            let v = core(&b, text);
            assert_eq!(v.kind(), Kind::String, "{text:?}");
            assert_eq!(unsafe { v.as_str() }, Some(text));
        }
    }

    #[test]
    fn test_v11_bool_family() {
        let b = builder();
        for text in ["y", "Yes", "ON"] {
            let v = scalar_from_text(&b, text, Schema::V11, None);
            assert_eq!(v.as_bool(), Some(true), "{text:?}");
        }
        for text in ["n", "No", "off"] {
            let v = scalar_from_text(&b, text, Schema::V11, None);
            assert_eq!(v.as_bool(), Some(false), "{text:?}");
        }
    }

    #[test]
    fn test_json_schema_is_strict() {
        let b = builder();
        // Capitalised literals are strings in JSON.
        for text in ["True", "Null", "~", "+1", "0x10", ".inf"] {
            let v = scalar_from_text(&b, text, Schema::Json, None);
            assert_eq!(v.kind(), Kind::String, "{text:?}");
        }
        assert_eq!(
            scalar_from_text(&b, "null", Schema::Json, None),
            Value::NULL
        );
        assert_eq!(
            scalar_from_text(&b, "true", Schema::Json, None).as_bool(),
            Some(true)
        );
        assert_eq!(
            unsafe { scalar_from_text(&b, "-12", Schema::Json, None).as_int() },
            Some(-12)
        );
        assert_eq!(
            unsafe { scalar_from_text(&b, "1.25e-2", Schema::Json, None).as_float() },
            Some(0.0125)
        );
    }

    #[test]
    fn test_failsafe_everything_is_string() {
        let b = builder();
        for text in ["null", "true", "42", "1.5"] {
            let v = scalar_from_text(&b, text, Schema::V12Failsafe, None);
            assert_eq!(v.kind(), Kind::String, "{text:?}");
        }
    }

    #[test]
    fn test_force_type() {
        let b = builder();
        // Force-string always wins.
        let v = scalar_from_text(&b, "42", Schema::V12Core, Some(Kind::String));
        assert_eq!(unsafe { v.as_str() }, Some("42"));
        // Force mismatch is invalid.
        assert_eq!(
            scalar_from_text(&b, "hello", Schema::V12Core, Some(Kind::Int)),
            Value::INVALID
        );
        // Force match passes through.
        let v = scalar_from_text(&b, "42", Schema::V12Core, Some(Kind::Int));
        assert_eq!(unsafe { v.as_int() }, Some(42));
    }

    #[test]
    fn test_int_edges() {
        let b = builder();
        let v = core(&b, "9223372036854775807");
        assert_eq!(unsafe { v.as_int() }, Some(i64::MAX));
        let v = core(&b, "-9223372036854775808");
        assert_eq!(unsafe { v.as_int() }, Some(i64::MIN));
        // One past i64: falls through to float.
        let v = core(&b, "9223372036854775808");
        assert_eq!(v.kind(), Kind::Float);
    }

    #[test]
    fn test_float_shapes() {
        let b = builder();
        for (text, want) in [
            ("1.", 1.0f64),
            (".5", 0.5),
            ("-0.25", -0.25),
            ("2E3", 2000.0),
            ("+1.5", 1.5),
        ] {
            let v = core(&b, text);
            assert_eq!(unsafe { v.as_float() }, Some(want), "{text:?}");
        }
    }
}

//! Argument validation and conversion for native functions.
//!
//! `ensure_arguments` checks *shape* (arity and types) against a compact
//! type mini-language. `convert_arguments` is a separate, printf-style
//! directive parser that additionally *extracts* Rust-native values out of
//! the argument list.
//!
//! `ensure_arguments` grammar:
//!
//! | spec    | matches                                      |
//! |---------|-----------------------------------------------|
//! | `a`     | array                                          |
//! | `b`     | boolean                                        |
//! | `f`     | function                                       |
//! | `n`     | number                                         |
//! | `N`     | number, coerced from any type                  |
//! | `o`     | object (including arrays and functions)        |
//! | `s`     | string                                         |
//! | `u`     | undefined                                      |
//! | `*`     | anything                                       |
//! | `(XY)`  | a parenthesized alternative group of specs     |
//! | `X\|Y`  | everything after `\|` is optional               |
//!
//! `|` separates required slots from optional ones — it does not mean
//! "either of two specs in the same slot" (that's what `()` is for). So
//! `"sn|o"` is "string, then number, then an optional object", and
//! `"(sn)u"` is "a slot that's a string or a number, then undefined".
//! A slot in the optional half implicitly also accepts `undefined`.

use smallvec::SmallVec;

use crate::error::{NatusError, NatusResult};
use crate::value::Value;

/// One parsed argument specifier: a set of acceptable single-letter kinds
/// (an alternative group collapses to more than one entry).
#[derive(Clone, Debug, PartialEq, Eq)]
enum Spec {
    Array,
    Boolean,
    Function,
    Number,
    NumberCoerced,
    Object,
    String,
    Undefined,
    Any,
}

impl Spec {
    fn from_char(c: char) -> Option<Spec> {
        Some(match c {
            'a' => Spec::Array,
            'b' => Spec::Boolean,
            'f' => Spec::Function,
            'n' => Spec::Number,
            'N' => Spec::NumberCoerced,
            'o' => Spec::Object,
            's' => Spec::String,
            'u' => Spec::Undefined,
            '*' => Spec::Any,
            _ => return None,
        })
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Spec::Array => value.is_array(),
            Spec::Boolean => value.type_name() == "boolean",
            Spec::Function => value.is_function(),
            Spec::Number => value.type_name() == "number",
            Spec::NumberCoerced => true,
            Spec::Object => value.is_object(),
            Spec::String => value.type_name() == "string",
            Spec::Undefined => value.is_undefined(),
            Spec::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Spec::Array => "array",
            Spec::Boolean => "boolean",
            Spec::Function => "function",
            Spec::Number | Spec::NumberCoerced => "number",
            Spec::Object => "object",
            Spec::String => "string",
            Spec::Undefined => "undefined",
            Spec::Any => "any",
        }
    }
}

/// One parameter slot: an alternative of [`Spec`]s, any one of which
/// satisfies it.
#[derive(Debug)]
struct Slot {
    alternatives: Vec<Spec>,
}

impl Slot {
    fn matches(&self, value: &Value) -> bool {
        self.alternatives.iter().any(|s| s.matches(value))
    }

    fn names(&self) -> String {
        self.alternatives.iter().map(Spec::name).collect::<Vec<_>>().join(" or ")
    }
}

/// Parses one `(`-free, `|`-free run of the format string into slots. A
/// bare char is a single-alternative slot; `(XY)` groups several specs
/// into one slot. `optional` makes every slot in this segment implicitly
/// accept `undefined` too.
fn parse_segment(segment: &str, optional: bool, slots: &mut Vec<Slot>) -> NatusResult<()> {
    let mut chars = segment.chars().peekable();
    while let Some(c) = chars.next() {
        let mut alternatives = Vec::new();
        if c == '(' {
            loop {
                match chars.next() {
                    Some(')') => break,
                    Some(inner) => {
                        let spec = Spec::from_char(inner)
                            .ok_or_else(|| NatusError::logic(format!("invalid argument spec character '{inner}'")))?;
                        alternatives.push(spec);
                    }
                    None => return Err(NatusError::logic("unterminated '(' in argument spec".to_string())),
                }
            }
        } else {
            let spec = Spec::from_char(c).ok_or_else(|| NatusError::logic(format!("invalid argument spec character '{c}'")))?;
            alternatives.push(spec);
        }
        if optional && !alternatives.contains(&Spec::Undefined) {
            alternatives.push(Spec::Undefined);
        }
        slots.push(Slot { alternatives });
    }
    Ok(())
}

/// Splits `format` on a single top-level `|` into a required segment and
/// an optional trailing segment, then parses each into slots.
fn parse_format(format: &str) -> NatusResult<Vec<Slot>> {
    if format.matches('|').count() > 1 {
        return Err(NatusError::logic("argument spec has more than one '|' separator".to_string()));
    }
    let mut halves = format.splitn(2, '|');
    let required = halves.next().unwrap_or("");
    let optional = halves.next();

    let mut slots = Vec::new();
    parse_segment(required, false, &mut slots)?;
    if let Some(optional) = optional {
        parse_segment(optional, true, &mut slots)?;
    }
    Ok(slots)
}

/// Checks `args` against `format`, erroring with a `TypeError` naming the
/// first mismatched position and what it expected. Arguments beyond the
/// format's length are ignored; missing trailing arguments are treated as
/// `undefined`, so a slot in the optional half is satisfied by an absent
/// argument.
pub fn ensure_arguments(args: &[Value], format: &str) -> NatusResult<()> {
    let slots = parse_format(format)?;
    for (i, slot) in slots.iter().enumerate() {
        let provided = args.get(i);
        let matches = match provided {
            Some(v) => slot.matches(v),
            None => slot.alternatives.contains(&Spec::Undefined),
        };
        if !matches {
            let actual = provided.map(Value::type_name).unwrap_or("undefined");
            return Err(NatusError::type_error(format!(
                "argument {} must be {} (got {})",
                i + 1,
                slot.names(),
                actual
            )));
        }
    }
    Ok(())
}

// -- convert_arguments: a printf-style directive parser ------------------

/// The integer-width modifier preceding a `d/i/o/u/x/X/n` conversion,
/// named after the `printf` length modifiers they come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IntWidth {
    Char,
    Short,
    Int,
    Long,
    LongLong,
    IntMax,
    PtrDiff,
    Size,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum DirectiveKind {
    Signed(IntWidth),
    Unsigned(IntWidth),
    /// `%n`: does not read the argument's value, instead yielding the
    /// zero-based index of this directive — still consumes one slot.
    Count,
    Float,
    Utf8Char,
    Utf8Str,
    Utf16Char,
    Utf16Str,
    Private(String),
}

fn parse_width(chars: &mut std::iter::Peekable<std::str::Chars>) -> IntWidth {
    match chars.peek() {
        Some('h') => {
            chars.next();
            if chars.peek() == Some(&'h') {
                chars.next();
                IntWidth::Char
            } else {
                IntWidth::Short
            }
        }
        Some('l') => {
            chars.next();
            if chars.peek() == Some(&'l') {
                chars.next();
                IntWidth::LongLong
            } else {
                IntWidth::Long
            }
        }
        Some('L') => {
            chars.next();
            IntWidth::LongLong
        }
        Some('j') => {
            chars.next();
            IntWidth::IntMax
        }
        Some('t') => {
            chars.next();
            IntWidth::PtrDiff
        }
        Some('z') => {
            chars.next();
            IntWidth::Size
        }
        _ => IntWidth::Int,
    }
}

/// Parses `format` into one [`DirectiveKind`] per `%`-directive. Text
/// outside a directive (including `%%`, a literal percent) is ignored —
/// it consumes no argument slot.
fn parse_directives(format: &str) -> NatusResult<Vec<DirectiveKind>> {
    let mut directives = Vec::new();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            continue;
        }
        match chars.peek() {
            Some('%') => {
                chars.next();
                continue;
            }
            Some('[') => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(c) => name.push(c),
                        None => return Err(NatusError::logic("unterminated '%[' private-name directive".to_string())),
                    }
                }
                directives.push(DirectiveKind::Private(name));
                continue;
            }
            _ => {}
        }

        let width = parse_width(&mut chars);
        let conv = chars
            .next()
            .ok_or_else(|| NatusError::logic("argument spec ends with a dangling '%'".to_string()))?;
        let directive = match conv {
            'd' | 'i' => DirectiveKind::Signed(width),
            'o' | 'u' | 'x' | 'X' => DirectiveKind::Unsigned(width),
            'n' => DirectiveKind::Count,
            'e' | 'f' | 'g' | 'E' | 'a' => DirectiveKind::Float,
            'c' if width == IntWidth::Long => DirectiveKind::Utf16Char,
            's' if width == IntWidth::Long => DirectiveKind::Utf16Str,
            'c' => DirectiveKind::Utf8Char,
            's' => DirectiveKind::Utf8Str,
            other => return Err(NatusError::logic(format!("invalid conversion specifier '%{other}'"))),
        };
        directives.push(directive);
    }
    Ok(directives)
}

fn narrow_signed(v: i64, width: IntWidth) -> i64 {
    match width {
        IntWidth::Char => v as i8 as i64,
        IntWidth::Short => v as i16 as i64,
        IntWidth::Int => v as i32 as i64,
        IntWidth::Long | IntWidth::LongLong | IntWidth::IntMax | IntWidth::PtrDiff | IntWidth::Size => v,
    }
}

fn narrow_unsigned(v: u64, width: IntWidth) -> u64 {
    match width {
        IntWidth::Char => v as u8 as u64,
        IntWidth::Short => v as u16 as u64,
        IntWidth::Int => v as u32 as u64,
        IntWidth::Long | IntWidth::LongLong | IntWidth::IntMax | IntWidth::PtrDiff | IntWidth::Size => v,
    }
}

/// One converted argument, extracted per the directive that consumed it.
#[derive(Debug)]
pub enum Converted {
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Utf8(String),
    Utf16(Vec<u16>),
    Value(Value),
}

impl Converted {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Converted::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            Converted::Unsigned(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Converted::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_utf8(&self) -> Option<&str> {
        match self {
            Converted::Utf8(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_utf16(&self) -> Option<&[u16]> {
        match self {
            Converted::Utf16(s) => Some(s.as_slice()),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Converted::Value(v) => Some(v),
            _ => None,
        }
    }
}

fn convert_one(directive: &DirectiveKind, value: &Value, index: usize) -> NatusResult<Converted> {
    match directive {
        DirectiveKind::Signed(width) => Ok(Converted::Integer(narrow_signed(value.to_number() as i64, *width))),
        DirectiveKind::Unsigned(width) => Ok(Converted::Unsigned(narrow_unsigned(value.to_number() as i64 as u64, *width))),
        DirectiveKind::Count => Ok(Converted::Integer(index as i64)),
        DirectiveKind::Float => Ok(Converted::Float(value.to_number())),
        DirectiveKind::Utf8Char => Ok(Converted::Utf8(value.to_rust_string()?.chars().next().map(String::from).unwrap_or_default())),
        DirectiveKind::Utf8Str => Ok(Converted::Utf8(value.to_rust_string()?)),
        DirectiveKind::Utf16Char => Ok(Converted::Utf16(value.to_rust_string()?.encode_utf16().take(1).collect())),
        DirectiveKind::Utf16Str => Ok(Converted::Utf16(value.to_rust_string()?.encode_utf16().collect())),
        DirectiveKind::Private(name) => {
            if !value.has_private_named(Some(name)) {
                return Err(NatusError::type_error(format!(
                    "argument {} has no private data named \"{name}\"",
                    index + 1
                )));
            }
            Ok(Converted::Value(value.clone()))
        }
    }
}

/// Extracts each `%`-directive in `format` from `args` in order. A
/// directive beyond the end of `args` pulls its value from `defaults`
/// instead (the variadic tail callers pass for optional trailing
/// parameters); a directive with neither an argument nor a default is a
/// `LogicError`.
pub fn convert_arguments(args: &[Value], defaults: &[Value], format: &str) -> NatusResult<SmallVec<[Converted; 4]>> {
    let directives = parse_directives(format)?;
    let mut out = SmallVec::with_capacity(directives.len());
    let mut defaults = defaults.iter();
    for (i, directive) in directives.iter().enumerate() {
        let value = match args.get(i) {
            Some(v) => v,
            None => defaults
                .next()
                .ok_or_else(|| NatusError::logic(format!("argument {} missing and no default supplied", i + 1)))?,
        };
        out.push(convert_one(directive, value, i)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use natus_backend::mock::MockBackend;
    use natus_backend::EngineHandle;

    fn test_ctx() -> Context {
        Context::new(EngineHandle::from_builtin("mock", MockBackend::new())).unwrap()
    }

    #[test]
    fn ensure_arguments_accepts_matching_shape() {
        let ctx = test_ctx();
        let args = vec![ctx.string("hi"), ctx.number(3.0)];
        assert!(ensure_arguments(&args, "sn").is_ok());
    }

    #[test]
    fn ensure_arguments_rejects_wrong_type() {
        let ctx = test_ctx();
        let args = vec![ctx.number(3.0)];
        let err = ensure_arguments(&args, "s").unwrap_err();
        assert!(err.to_string().contains("argument 1"));
    }

    #[test]
    fn optional_trailing_argument_defaults_to_undefined() {
        let ctx = test_ctx();
        let args = vec![ctx.string("only")];
        assert!(ensure_arguments(&args, "s|(su)").is_ok());
    }

    #[test]
    fn pipe_separates_required_from_optional() {
        let ctx = test_ctx();
        // Two required, one optional: omitting the third is fine...
        let args = vec![ctx.string("a"), ctx.number(1.0)];
        assert!(ensure_arguments(&args, "sn|s").is_ok());
        // ...but omitting the second (required) is not.
        let args = vec![ctx.string("a")];
        assert!(ensure_arguments(&args, "sn|s").is_err());
    }

    #[test]
    fn more_than_one_pipe_is_a_logic_error() {
        let ctx = test_ctx();
        let args = vec![ctx.string("a")];
        let err = ensure_arguments(&args, "s|s|s").unwrap_err();
        assert!(matches!(err, NatusError::Logic { .. }));
    }

    #[test]
    fn convert_arguments_extracts_printf_style_types() {
        let ctx = test_ctx();
        let args = vec![ctx.string("hi"), ctx.number(42.0)];
        let converted = convert_arguments(&args, &[], "%s%d").unwrap();
        assert_eq!(converted[0].as_utf8(), Some("hi"));
        assert_eq!(converted[1].as_integer(), Some(42));
    }

    #[test]
    fn convert_arguments_narrows_by_width_modifier() {
        let ctx = test_ctx();
        let args = vec![ctx.number(300.0)];
        let converted = convert_arguments(&args, &[], "%hhd").unwrap();
        assert_eq!(converted[0].as_integer(), Some(300i64 as i8 as i64));
    }

    #[test]
    fn convert_arguments_falls_back_to_default_when_args_run_short() {
        let ctx = test_ctx();
        let args = vec![ctx.string("only")];
        let defaults = vec![ctx.number(7.0)];
        let converted = convert_arguments(&args, &defaults, "%s%d").unwrap();
        assert_eq!(converted[0].as_utf8(), Some("only"));
        assert_eq!(converted[1].as_integer(), Some(7));
    }

    #[test]
    fn convert_arguments_missing_argument_with_no_default_is_an_error() {
        let ctx = test_ctx();
        let args = vec![ctx.string("only")];
        let err = convert_arguments(&args, &[], "%s%d").unwrap_err();
        assert!(matches!(err, NatusError::Logic { .. }));
    }

    #[test]
    fn convert_arguments_fetches_typed_private_slot() {
        let ctx = test_ctx();
        let obj = ctx.object();
        obj.set_private_named(Some("handle"), 99u32).unwrap();
        let args = vec![obj];
        let converted = convert_arguments(&args, &[], "%[handle]").unwrap();
        assert!(converted[0].as_value().unwrap().with_private_named::<u32, _>(Some("handle"), |v| *v) == Some(99));
    }

    #[test]
    fn convert_arguments_rejects_missing_private_slot() {
        let ctx = test_ctx();
        let obj = ctx.object();
        let args = vec![obj];
        let err = convert_arguments(&args, &[], "%[handle]").unwrap_err();
        assert!(matches!(err, NatusError::Type { .. }));
    }

    #[test]
    fn convert_arguments_utf16_variant_encodes_wide_chars() {
        let ctx = test_ctx();
        let args = vec![ctx.string("hi")];
        let converted = convert_arguments(&args, &[], "%ls").unwrap();
        assert_eq!(converted[0].as_utf16(), Some(&[b'h' as u16, b'i' as u16][..]));
    }
}

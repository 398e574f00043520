// Expression parser
//
// Syntax tree for debugger watch expressions and the chumsky grammar that
// builds it, C# operator precedence included.

use crate::eval::operators::{BinaryOp, UnaryOp};
use crate::types::Primitive;
use chumsky::prelude::*;
use chumsky::Parser;

type Err<'a> = extra::Err<Rich<'a, char>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Primitive(Primitive),
    String(String),
    Null,
}

/// Type written in source: `int`, `Ns.Type`, `List<int>`, `int[]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeName {
    /// Dotted name; predefined keywords are stored as their runtime name.
    pub name: String,
    pub type_args: Vec<TypeName>,
    pub array_rank: usize,
}

impl TypeName {
    fn new(segments: Vec<&str>, type_args: Vec<TypeName>, array_rank: usize) -> Self {
        let joined = segments.join(".");
        let name = match predefined_type(&joined) {
            Some(full) => full.to_string(),
            None => joined,
        };
        Self {
            name,
            type_args,
            array_rank,
        }
    }

    /// Name as found in metadata: generic arity is encoded as `` `N ``.
    pub fn metadata_name(&self) -> String {
        let mut name = self.name.clone();
        if !self.type_args.is_empty() {
            name.push_str(&format!("`{}", self.type_args.len()));
        }
        for _ in 0..self.array_rank {
            name.push_str("[]");
        }
        name
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InterpolatedPart {
    Text(String),
    Hole(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Identifier(String),
    /// `Name<T1, ..>`
    GenericName {
        name: String,
        type_args: Vec<TypeName>,
    },
    This,
    /// Keyword naming a runtime type (`int`, `string`), holds the runtime name.
    PredefinedType(String),
    MemberAccess {
        target: Box<Expr>,
        name: String,
        type_args: Option<Vec<TypeName>>,
        conditional: bool,
    },
    ElementAccess {
        target: Box<Expr>,
        args: Vec<Expr>,
        conditional: bool,
    },
    Invocation {
        target: Box<Expr>,
        args: Vec<Expr>,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `checked(..)` (true) or `unchecked(..)` (false)
    Checked(bool, Box<Expr>),
    SizeOf(TypeName),
    Interpolated(Vec<InterpolatedPart>),
    /// Keyword construct that parses but cannot be evaluated (`typeof`, ...).
    Unsupported(String),
}

impl Expr {
    fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Self::Binary(op, Box::new(lhs), Box::new(rhs))
    }
}

enum Postfix {
    Member {
        name: String,
        type_args: Option<Vec<TypeName>>,
        conditional: bool,
    },
    Element {
        args: Vec<Expr>,
        conditional: bool,
    },
    Call(Vec<Expr>),
}

impl Postfix {
    fn apply(self, target: Expr) -> Expr {
        let target = Box::new(target);
        match self {
            Self::Member {
                name,
                type_args,
                conditional,
            } => Expr::MemberAccess {
                target,
                name,
                type_args,
                conditional,
            },
            Self::Element { args, conditional } => Expr::ElementAccess {
                target,
                args,
                conditional,
            },
            Self::Call(args) => Expr::Invocation { target, args },
        }
    }
}

pub fn predefined_type(keyword: &str) -> Option<&'static str> {
    Some(match keyword {
        "bool" => "System.Boolean",
        "byte" => "System.Byte",
        "sbyte" => "System.SByte",
        "char" => "System.Char",
        "short" => "System.Int16",
        "ushort" => "System.UInt16",
        "int" => "System.Int32",
        "uint" => "System.UInt32",
        "long" => "System.Int64",
        "ulong" => "System.UInt64",
        "float" => "System.Single",
        "double" => "System.Double",
        "decimal" => "System.Decimal",
        "string" => "System.String",
        "object" => "System.Object",
        _ => return None,
    })
}

fn name_or_keyword(name: &str) -> Expr {
    match name {
        "true" => Expr::Literal(Literal::Primitive(Primitive::Bool(true))),
        "false" => Expr::Literal(Literal::Primitive(Primitive::Bool(false))),
        "null" => Expr::Literal(Literal::Null),
        "this" => Expr::This,
        "base" | "typeof" | "new" | "default" | "nameof" | "is" | "as" | "await"
        | "stackalloc" | "delegate" | "ref" | "out" => Expr::Unsupported(name.to_string()),
        other => match predefined_type(other) {
            Some(full) => Expr::PredefinedType(full.to_string()),
            None => Expr::Identifier(other.to_string()),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntSuffix {
    None,
    U,
    L,
    UL,
}

/// Smallest type of the suffix family that holds the value.
fn integer_literal(value: u64, suffix: IntSuffix) -> Option<Primitive> {
    let int = i32::try_from(value).ok().map(Primitive::I32);
    let uint = u32::try_from(value).ok().map(Primitive::U32);
    let long = i64::try_from(value).ok().map(Primitive::I64);
    let ulong = Some(Primitive::U64(value));
    match suffix {
        IntSuffix::None => int.or(uint).or(long).or(ulong),
        IntSuffix::U => uint.or(ulong),
        IntSuffix::L => long.or(ulong),
        IntSuffix::UL => ulong,
    }
}

fn integer<'a>() -> impl Parser<'a, &'a str, Primitive, Err<'a>> + Clone {
    let hex = just("0x")
        .or(just("0X"))
        .ignore_then(text::digits(16).at_least(1).to_slice())
        .map(|s: &str| (s, 16));
    let dec = text::digits(10)
        .at_least(1)
        .to_slice()
        .map(|s: &str| (s, 10));
    let suffix = choice((
        one_of("uU").then(one_of("lL")).to(IntSuffix::UL),
        one_of("lL").then(one_of("uU")).to(IntSuffix::UL),
        one_of("uU").to(IntSuffix::U),
        one_of("lL").to(IntSuffix::L),
    ))
    .or_not();

    hex.or(dec)
        .then(suffix)
        .try_map(|((digits, radix), suffix), span| {
            u64::from_str_radix(digits, radix)
                .ok()
                .and_then(|v| integer_literal(v, suffix.unwrap_or(IntSuffix::None)))
                .ok_or_else(|| Rich::custom(span, "error CS1021: Integral constant is too large"))
        })
        .labelled("integer literal")
}

fn real<'a>() -> impl Parser<'a, &'a str, Primitive, Err<'a>> + Clone {
    let digits = text::digits(10).at_least(1);
    let fraction = just('.').then(digits.clone());
    let exponent = one_of("eE").then(one_of("+-").or_not()).then(digits.clone());

    digits
        .then(fraction.or_not())
        .then(exponent.or_not())
        .to_slice()
        .then(one_of("fFdDmM").or_not())
        .try_map(|(text, suffix): (&str, Option<char>), span| {
            let is_real = text.contains(['.', 'e', 'E']) || suffix.is_some();
            if !is_real {
                return Err(Rich::custom(span, "not a real literal"));
            }
            let invalid = || Rich::custom(span, "invalid real literal");
            match suffix {
                Some('f' | 'F') => text.parse::<f32>().map(Primitive::F32).map_err(|_| invalid()),
                Some('m' | 'M') => Err(Rich::custom(
                    span,
                    "decimal literals are not supported in expressions",
                )),
                _ => text.parse::<f64>().map(Primitive::F64).map_err(|_| invalid()),
            }
        })
        .labelled("real literal")
}

fn escape<'a>() -> impl Parser<'a, &'a str, char, Err<'a>> + Clone {
    let unicode = just('u')
        .ignore_then(text::digits(16).exactly(4).to_slice())
        .try_map(|hex: &str, span| {
            u32::from_str_radix(hex, 16)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| Rich::custom(span, "invalid unicode escape"))
        });
    just('\\').ignore_then(choice((
        just('n').to('\n'),
        just('t').to('\t'),
        just('r').to('\r'),
        just('0').to('\0'),
        just('a').to('\x07'),
        just('b').to('\x08'),
        just('f').to('\x0C'),
        just('v').to('\x0B'),
        just('\\').to('\\'),
        just('\'').to('\''),
        just('"').to('"'),
        unicode,
    )))
}

fn char_literal<'a>() -> impl Parser<'a, &'a str, Primitive, Err<'a>> + Clone {
    escape()
        .or(none_of("'\\"))
        .delimited_by(just('\''), just('\''))
        .try_map(|c: char, span| {
            u16::try_from(c as u32)
                .map(Primitive::Char)
                .map_err(|_| Rich::custom(span, "character literal out of range"))
        })
        .labelled("character literal")
}

fn string_literal<'a>() -> impl Parser<'a, &'a str, String, Err<'a>> + Clone {
    let regular = escape()
        .or(none_of("\"\\"))
        .repeated()
        .collect::<String>()
        .delimited_by(just('"'), just('"'));
    let verbatim = just("\"\"")
        .to('"')
        .or(none_of("\""))
        .repeated()
        .collect::<String>()
        .delimited_by(just("@\""), just('"'));
    verbatim.or(regular).labelled("string literal")
}

fn type_name<'a>() -> impl Parser<'a, &'a str, TypeName, Err<'a>> + Clone {
    recursive(|ty| {
        let args = ty
            .separated_by(just(',').padded())
            .collect::<Vec<_>>()
            .delimited_by(just('<').padded(), just('>').padded());
        let rank = just('[')
            .padded()
            .then(just(']').padded())
            .repeated()
            .collect::<Vec<_>>();

        text::ascii::ident()
            .separated_by(just('.').padded())
            .at_least(1)
            .collect::<Vec<&str>>()
            .then(args.or_not())
            .then(rank)
            .map(|((segments, args), rank)| {
                TypeName::new(segments, args.unwrap_or_default(), rank.len())
            })
    })
    .labelled("type name")
}

/// Semicolon-separated list so that callers can reject anything other than
/// a single expression with a precise message.
pub fn parser<'a>() -> impl Parser<'a, &'a str, Vec<Expr>, Err<'a>> {
    let expr = recursive(|expr| {
        let op = |c| just(c).padded();
        let sym = |s: &'static str| just(s).padded();

        let args = expr
            .clone()
            .separated_by(op(','))
            .collect::<Vec<_>>();
        let type_args = type_name()
            .separated_by(op(','))
            .collect::<Vec<_>>()
            .delimited_by(op('<'), op('>'));
        // `M<int>` is a generic name only when an invocation or member access
        // follows; otherwise `<` is a comparison
        let generic_follow = op('(').or(op('.')).rewind();

        let literal = choice((
            real().map(Literal::Primitive),
            integer().map(Literal::Primitive),
            char_literal().map(Literal::Primitive),
            string_literal().map(Literal::String),
        ))
        .map(Expr::Literal);

        let hole = expr
            .clone()
            .delimited_by(just('{'), just('}'))
            .map(InterpolatedPart::Hole);
        let text_run = choice((
            just("{{").to('{'),
            just("}}").to('}'),
            escape(),
            none_of("\"\\{}"),
        ))
        .repeated()
        .at_least(1)
        .collect::<String>()
        .map(InterpolatedPart::Text);
        let interpolated = text_run
            .or(hole)
            .repeated()
            .collect::<Vec<_>>()
            .delimited_by(just("$\""), just('"'))
            .map(Expr::Interpolated)
            .labelled("interpolated string");

        let checked = just("checked")
            .to(true)
            .or(just("unchecked").to(false))
            .then(expr.clone().delimited_by(op('('), op(')')))
            .map(|(checked, inner)| Expr::Checked(checked, Box::new(inner)))
            .boxed();

        let size_of = just("sizeof")
            .ignore_then(type_name().delimited_by(op('('), op(')')))
            .map(Expr::SizeOf);

        let generic_name = text::ascii::ident()
            .then(type_args.clone())
            .then_ignore(generic_follow.clone())
            .map(|(name, type_args): (&str, _)| Expr::GenericName {
                name: name.to_string(),
                type_args,
            });

        let name = text::ascii::ident().map(name_or_keyword);

        let atom = choice((
            literal,
            interpolated,
            checked,
            size_of,
            generic_name,
            name,
            expr.clone().delimited_by(op('('), op(')')),
        ))
        .padded()
        .boxed();

        let member_name = text::ascii::ident()
            .map(|s: &str| s.to_string())
            .then(type_args.then_ignore(generic_follow).or_not())
            .labelled("member name");

        let postfix = choice((
            op('.')
                .ignore_then(member_name.clone())
                .map(|(name, type_args)| Postfix::Member {
                    name,
                    type_args,
                    conditional: false,
                }),
            sym("?.")
                .ignore_then(member_name)
                .map(|(name, type_args)| Postfix::Member {
                    name,
                    type_args,
                    conditional: true,
                }),
            args.clone()
                .delimited_by(op('['), op(']'))
                .map(|args| Postfix::Element {
                    args,
                    conditional: false,
                }),
            args.clone()
                .delimited_by(sym("?["), op(']'))
                .map(|args| Postfix::Element {
                    args,
                    conditional: true,
                }),
            args.delimited_by(op('('), op(')')).map(Postfix::Call),
        ));
        let primary = atom
            .foldl(postfix.repeated(), |target, postfix| postfix.apply(target))
            .boxed();

        let unary_op = choice((
            op('+').to(UnaryOp::Plus),
            op('-').to(UnaryOp::Minus),
            op('!').to(UnaryOp::Not),
            op('~').to(UnaryOp::BitNot),
        ));
        let unary = unary_op
            .repeated()
            .foldr(primary, |op, rhs| Expr::Unary(op, Box::new(rhs)))
            .boxed();

        let product = unary.clone().foldl(
            choice((
                op('*').to(BinaryOp::Mul),
                op('/').to(BinaryOp::Div),
                op('%').to(BinaryOp::Rem),
            ))
            .then(unary)
            .repeated(),
            |lhs, (op, rhs)| Expr::binary(op, lhs, rhs),
        )
        .boxed();
        let sum = product.clone().foldl(
            choice((op('+').to(BinaryOp::Add), op('-').to(BinaryOp::Sub)))
                .then(product)
                .repeated(),
            |lhs, (op, rhs)| Expr::binary(op, lhs, rhs),
        )
        .boxed();
        let shift = sum.clone().foldl(
            choice((sym("<<").to(BinaryOp::Shl), sym(">>").to(BinaryOp::Shr)))
                .then(sum)
                .repeated(),
            |lhs, (op, rhs)| Expr::binary(op, lhs, rhs),
        )
        .boxed();
        let relational = shift.clone().foldl(
            choice((
                sym("<=").to(BinaryOp::Le),
                sym(">=").to(BinaryOp::Ge),
                op('<').to(BinaryOp::Lt),
                op('>').to(BinaryOp::Gt),
            ))
            .then(shift)
            .repeated(),
            |lhs, (op, rhs)| Expr::binary(op, lhs, rhs),
        )
        .boxed();
        let equality = relational.clone().foldl(
            choice((sym("==").to(BinaryOp::Eq), sym("!=").to(BinaryOp::Ne)))
                .then(relational)
                .repeated(),
            |lhs, (op, rhs)| Expr::binary(op, lhs, rhs),
        )
        .boxed();
        // A lone `&` that is really the start of `&&` fails on its right
        // operand and the repetition backs off
        let bit_and = equality.clone().foldl(
            op('&').to(BinaryOp::BitAnd).then(equality).repeated(),
            |lhs, (op, rhs)| Expr::binary(op, lhs, rhs),
        )
        .boxed();
        let bit_xor = bit_and.clone().foldl(
            op('^').to(BinaryOp::BitXor).then(bit_and).repeated(),
            |lhs, (op, rhs)| Expr::binary(op, lhs, rhs),
        )
        .boxed();
        let bit_or = bit_xor.clone().foldl(
            op('|').to(BinaryOp::BitOr).then(bit_xor).repeated(),
            |lhs, (op, rhs)| Expr::binary(op, lhs, rhs),
        )
        .boxed();
        let and = bit_or.clone().foldl(
            sym("&&").to(BinaryOp::And).then(bit_or).repeated(),
            |lhs, (op, rhs)| Expr::binary(op, lhs, rhs),
        )
        .boxed();
        let or = and.clone().foldl(
            sym("||").to(BinaryOp::Or).then(and).repeated(),
            |lhs, (op, rhs)| Expr::binary(op, lhs, rhs),
        )
        .boxed();

        // `??` is right-associative
        or.clone()
            .then(sym("??").ignore_then(or).repeated().collect::<Vec<_>>())
            .map(|(first, mut rest): (Expr, Vec<Expr>)| {
                let Some(mut rhs) = rest.pop() else {
                    return first;
                };
                while let Some(lhs) = rest.pop() {
                    rhs = Expr::binary(BinaryOp::Coalesce, lhs, rhs);
                }
                Expr::binary(BinaryOp::Coalesce, first, rhs)
            })
    });

    expr.separated_by(just(';').padded())
        .allow_trailing()
        .collect::<Vec<_>>()
        .padded()
        .then_ignore(end())
}

#[cfg(test)]
mod test {
    use super::*;

    fn ident(name: &str) -> Expr {
        Expr::Identifier(name.to_string())
    }

    fn member(target: Expr, name: &str, conditional: bool) -> Expr {
        Expr::MemberAccess {
            target: Box::new(target),
            name: name.to_string(),
            type_args: None,
            conditional,
        }
    }

    fn int(v: i32) -> Expr {
        Expr::Literal(Literal::Primitive(Primitive::I32(v)))
    }

    fn parse_one(text: &str) -> Expr {
        let mut exprs = parser().parse(text).into_result().unwrap();
        assert_eq!(exprs.len(), 1, "{}", text);
        exprs.remove(0)
    }

    #[test]
    fn test_expr_parsing() {
        struct TestCase {
            string: &'static str,
            expr: Expr,
        }
        let test_cases = vec![
            TestCase {
                string: "a.b.c",
                expr: member(member(ident("a"), "b", false), "c", false),
            },
            TestCase {
                string: "a?.b.c",
                expr: member(member(ident("a"), "b", true), "c", false),
            },
            TestCase {
                string: "1 + 2 * 3",
                expr: Expr::binary(
                    BinaryOp::Add,
                    int(1),
                    Expr::binary(BinaryOp::Mul, int(2), int(3)),
                ),
            },
            TestCase {
                string: "2 << 3 < 1",
                expr: Expr::binary(
                    BinaryOp::Lt,
                    Expr::binary(BinaryOp::Shl, int(2), int(3)),
                    int(1),
                ),
            },
            TestCase {
                string: "a && b & c",
                expr: Expr::binary(
                    BinaryOp::And,
                    ident("a"),
                    Expr::binary(BinaryOp::BitAnd, ident("b"), ident("c")),
                ),
            },
            TestCase {
                string: "a ?? b ?? c",
                expr: Expr::binary(
                    BinaryOp::Coalesce,
                    ident("a"),
                    Expr::binary(BinaryOp::Coalesce, ident("b"), ident("c")),
                ),
            },
            TestCase {
                string: "-~x",
                expr: Expr::Unary(
                    UnaryOp::Minus,
                    Box::new(Expr::Unary(UnaryOp::BitNot, Box::new(ident("x")))),
                ),
            },
            TestCase {
                string: "arr[i, 1]",
                expr: Expr::ElementAccess {
                    target: Box::new(ident("arr")),
                    args: vec![ident("i"), int(1)],
                    conditional: false,
                },
            },
            TestCase {
                string: "list.Get<int>(0)",
                expr: Expr::Invocation {
                    target: Box::new(Expr::MemberAccess {
                        target: Box::new(ident("list")),
                        name: "Get".to_string(),
                        type_args: Some(vec![TypeName {
                            name: "System.Int32".to_string(),
                            type_args: vec![],
                            array_rank: 0,
                        }]),
                        conditional: false,
                    }),
                    args: vec![int(0)],
                },
            },
            TestCase {
                string: "a < b",
                expr: Expr::binary(BinaryOp::Lt, ident("a"), ident("b")),
            },
            TestCase {
                string: "int.MaxValue",
                expr: member(Expr::PredefinedType("System.Int32".to_string()), "MaxValue", false),
            },
            TestCase {
                string: "this.x == null",
                expr: Expr::binary(
                    BinaryOp::Eq,
                    member(Expr::This, "x", false),
                    Expr::Literal(Literal::Null),
                ),
            },
            TestCase {
                string: "checked(x + 1)",
                expr: Expr::Checked(
                    true,
                    Box::new(Expr::binary(BinaryOp::Add, ident("x"), int(1))),
                ),
            },
            TestCase {
                string: "$\"n={n}{{\"",
                expr: Expr::Interpolated(vec![
                    InterpolatedPart::Text("n=".to_string()),
                    InterpolatedPart::Hole(ident("n")),
                    InterpolatedPart::Text("{".to_string()),
                ]),
            },
            TestCase {
                string: "1.ToString()",
                expr: Expr::Invocation {
                    target: Box::new(member(int(1), "ToString", false)),
                    args: vec![],
                },
            },
        ];

        for tc in test_cases {
            assert_eq!(parse_one(tc.string), tc.expr, "{}", tc.string);
        }
    }

    #[test]
    fn test_literal_typing() {
        struct TestCase {
            string: &'static str,
            value: Primitive,
        }
        let test_cases = vec![
            TestCase {
                string: "2147483647",
                value: Primitive::I32(i32::MAX),
            },
            TestCase {
                string: "2147483648",
                value: Primitive::U32(2147483648),
            },
            TestCase {
                string: "4294967296",
                value: Primitive::I64(4294967296),
            },
            TestCase {
                string: "0xFFFFFFFFFFFFFFFF",
                value: Primitive::U64(u64::MAX),
            },
            TestCase {
                string: "5u",
                value: Primitive::U32(5),
            },
            TestCase {
                string: "5L",
                value: Primitive::I64(5),
            },
            TestCase {
                string: "5UL",
                value: Primitive::U64(5),
            },
            TestCase {
                string: "2.5",
                value: Primitive::F64(2.5),
            },
            TestCase {
                string: "1e3",
                value: Primitive::F64(1000.0),
            },
            TestCase {
                string: "1.5f",
                value: Primitive::F32(1.5),
            },
            TestCase {
                string: "'a'",
                value: Primitive::Char(97),
            },
            TestCase {
                string: "'\\n'",
                value: Primitive::Char(10),
            },
        ];

        for tc in test_cases {
            assert_eq!(
                parse_one(tc.string),
                Expr::Literal(Literal::Primitive(tc.value)),
                "{}",
                tc.string
            );
        }
    }

    #[test]
    fn test_strings_and_statements() {
        assert_eq!(
            parse_one(r#""a\"b""#),
            Expr::Literal(Literal::String("a\"b".to_string()))
        );
        assert_eq!(
            parse_one(r#"@"c:\dir""""#),
            Expr::Literal(Literal::String("c:\\dir\"".to_string()))
        );
        assert!(parser().parse("").into_result().unwrap().is_empty());
        assert_eq!(parser().parse("a; b").into_result().unwrap().len(), 2);
    }

    #[test]
    fn test_expr_parsing_error() {
        for text in ["a b", "a = 1", "x ? 1 : 2", "(int)x", "a.", "1m", "99999999999999999999"] {
            assert!(
                parser().parse(text).into_result().is_err(),
                "{} should not parse",
                text
            );
        }
    }
}

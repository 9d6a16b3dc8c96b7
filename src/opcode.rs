//! The bytecode instruction set
//!
//! Every opcode is one byte, optionally followed by an inline operand whose
//! width is fixed per opcode. Wider index operands are expressed by loading a
//! register opcode (`RegInd*`, `RegStr*`, `RegBigInt*`) immediately before
//! the consuming instruction.

use crate::error::VmError;

macro_rules! opcodes {
    ($($name:ident => $span:expr, $text:literal;)*) => {
        /// One interpreter instruction.
        #[derive(Clone, Copy, PartialEq, Eq, Debug)]
        #[repr(u8)]
        pub enum Op {
            $($name,)*
        }

        impl Op {
            /// Decode a single instruction byte.
            pub fn from_byte(b: u8) -> Result<Op, VmError> {
                $(
                    if b == Op::$name as u8 {
                        return Ok(Op::$name);
                    }
                )*
                Err(VmError::internal(format!("invalid opcode byte {b:#04x}")))
            }

            /// Number of inline operand bytes following the opcode.
            pub fn operand_span(self) -> usize {
                match self {
                    $(Op::$name => $span,)*
                }
            }

            /// Mnemonic used by the disassembler.
            pub fn name(self) -> &'static str {
                match self {
                    $(Op::$name => $text,)*
                }
            }
        }
    };
}

opcodes! {
    // constants and immediate loads
    Zero => 0, "zero";
    One => 0, "one";
    ShortNumber => 2, "shortnumber";
    IntNumber => 4, "intnumber";
    Number => 0, "number";
    String => 0, "string";
    BigInt => 0, "bigint";
    Regex => 0, "regex";
    True => 0, "true";
    False => 0, "false";
    Null => 0, "null";
    Undef => 0, "undef";
    This => 0, "this";
    ThisFn => 0, "thisfn";

    // register loads feeding the next instruction
    RegInd1 => 1, "regind1";
    RegInd2 => 2, "regind2";
    RegInd4 => 4, "regind4";
    RegStr1 => 1, "regstr1";
    RegStr2 => 2, "regstr2";
    RegStr4 => 4, "regstr4";
    RegBigInt1 => 1, "regbigint1";
    RegBigInt2 => 2, "regbigint2";

    // operand stack shuffling
    Pop => 0, "pop";
    PopResult => 0, "popresult";
    Dup => 0, "dup";
    Dup2 => 0, "dup2";
    Swap => 0, "swap";

    // variables and locals
    GetVar => 0, "getvar";
    SetVar => 0, "setvar";
    SetConstVar => 0, "setconstvar";
    GetVar1 => 1, "getvar1";
    SetVar1 => 1, "setvar1";
    SetConstVar1 => 1, "setconstvar1";
    VarIncDec => 1, "varincdec";
    LocalLoad => 0, "localload";
    LocalClear => 0, "localclear";

    // arithmetic and bit operations
    Add => 0, "add";
    Sub => 0, "sub";
    Mul => 0, "mul";
    Div => 0, "div";
    Mod => 0, "mod";
    Exp => 0, "exp";
    Neg => 0, "neg";
    Pos => 0, "pos";
    Not => 0, "not";
    BitNot => 0, "bitnot";
    BitAnd => 0, "bitand";
    BitOr => 0, "bitor";
    BitXor => 0, "bitxor";
    Lsh => 0, "lsh";
    Rsh => 0, "rsh";
    Ursh => 0, "ursh";

    // comparisons
    Eq => 0, "eq";
    Ne => 0, "ne";
    StrictEq => 0, "stricteq";
    StrictNe => 0, "strictne";
    Lt => 0, "lt";
    Le => 0, "le";
    Gt => 0, "gt";
    Ge => 0, "ge";
    Typeof => 0, "typeof";
    TypeofName => 0, "typeofname";

    // names and properties
    Name => 0, "name";
    BindName => 0, "bindname";
    SetName => 0, "setname";
    GetProp => 0, "getprop";
    SetProp => 0, "setprop";
    GetElem => 0, "getelem";
    SetElem => 0, "setelem";
    DelProp => 0, "delprop";

    // scope chain
    ScopeSave => 0, "scopesave";
    ScopeLoad => 0, "scopeload";
    CatchScope => 1, "catchscope";

    // control flow
    Goto => 2, "goto";
    IfTrue => 2, "iftrue";
    IfFalse => 2, "iffalse";
    IfFalsePop => 2, "iffalsepop";
    Gosub => 2, "gosub";
    StartSub => 0, "startsub";
    RetSub => 0, "retsub";
    Line => 2, "line";
    Debugger => 0, "debugger";

    // object and array literals
    LiteralNewObject => 0, "literalnewobject";
    LiteralNewArray => 0, "literalnewarray";
    LiteralSet => 0, "literalset";
    ObjectLit => 0, "objectlit";
    ArrayLit => 0, "arraylit";

    // closures, calls and returns
    Closure => 0, "closure";
    Call => 0, "call";
    TailCall => 0, "tailcall";
    New => 0, "new";
    Return => 0, "return";
    ReturnResult => 0, "returnresult";
    RetUndef => 0, "retundef";

    // exceptions
    Throw => 2, "throw";
    RethrowLocal => 0, "rethrowlocal";

    // generators
    GeneratorCreate => 2, "generatorcreate";
    Yield => 2, "yield";
    GeneratorEnd => 2, "generatorend";
    GeneratorReturn => 2, "generatorreturn";
}

impl Op {
    /// Instructions whose two-byte operand is a relative branch target.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Op::Goto | Op::IfTrue | Op::IfFalse | Op::IfFalsePop | Op::Gosub
        )
    }
}

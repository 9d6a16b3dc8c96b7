//! Runtime value representation
//!
//! The core [`Value`] type carried through interpreter stack slots, plus the
//! minimal object storage that the default runtime support operates on.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::code::{CompiledUnit, RegexLiteral};
use crate::error::VmError;
use crate::interpreter::continuation::Continuation;
use crate::interpreter::dispatch::Throwable;
use crate::interpreter::generator::Generator;
use crate::interpreter::Interp;

/// Trait for types that have cheap (O(1), reference-counted) clones.
///
/// Makes it explicit when a clone only bumps a reference count instead of
/// copying data.
pub trait CheapClone: Clone {
    fn cheap_clone(&self) -> Self {
        self.clone()
    }
}

impl<T: ?Sized> CheapClone for Rc<T> {}

pub type ObjectRef = Rc<RefCell<ObjectData>>;

/// Property storage for the built-in host. Insertion order is preserved so
/// enumeration and serialization stay deterministic.
#[derive(Debug, Default)]
pub struct ObjectData {
    pub props: IndexMap<Rc<str>, Value>,
    /// Enclosing scope when this object participates in a scope chain.
    pub parent: Option<ObjectRef>,
}

impl ObjectData {
    pub fn new() -> Self {
        ObjectData::default()
    }

    pub fn with_parent(parent: ObjectRef) -> Self {
        ObjectData {
            props: IndexMap::new(),
            parent: Some(parent),
        }
    }
}

/// An interpreted function: compiled code closed over its defining scope.
#[derive(Debug)]
pub struct InterpFn {
    pub unit: Rc<CompiledUnit>,
    pub parent_scope: Value,
    /// Home object for methods; threaded through activation creation.
    pub home_object: Option<Value>,
}

/// A function with pre-bound `this` and leading arguments. Unwrapped by the
/// call sequence before a frame is created for the target.
#[derive(Debug)]
pub struct BoundFn {
    pub target: Value,
    pub bound_this: Value,
    pub bound_args: Vec<Value>,
}

pub type NativeImpl = dyn Fn(&mut Interp, &Value, &[Value]) -> Result<Value, VmError>;

/// A host-provided function callable from bytecode.
#[derive(Clone)]
pub struct NativeFn {
    pub name: Rc<str>,
    func: Rc<NativeImpl>,
}

impl NativeFn {
    pub fn new(
        name: impl Into<Rc<str>>,
        func: impl Fn(&mut Interp, &Value, &[Value]) -> Result<Value, VmError> + 'static,
    ) -> Self {
        NativeFn {
            name: name.into(),
            func: Rc::new(func),
        }
    }

    pub fn call(
        &self,
        interp: &mut Interp,
        this: &Value,
        args: &[Value],
    ) -> Result<Value, VmError> {
        (self.func)(interp, this, args)
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFn").field("name", &self.name).finish()
    }
}

/// In-flight object or array literal, staged on the operand stack while its
/// element values are evaluated.
#[derive(Debug)]
pub struct LiteralStage {
    pub keys: Option<Rc<Vec<Rc<str>>>>,
    pub values: Vec<Value>,
}

/// A runtime value held in a stack slot, variable, or property.
///
/// `DoubleMark` never escapes the interpreter: it flags a slot whose numeric
/// payload lives in the parallel double array of the frame.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    /// Sentinel for a slot whose number is stored unboxed alongside.
    DoubleMark,
    Str(Rc<str>),
    BigInt(Rc<BigInt>),
    Regex(Rc<RegexLiteral>),
    Object(ObjectRef),
    Function(Rc<InterpFn>),
    Bound(Rc<BoundFn>),
    Native(NativeFn),
    Generator(Rc<Generator>),
    Continuation(Rc<Continuation>),
    /// Internal: a routed fault parked in an exception slot while a handler
    /// or cleanup block runs.
    Throwable(Rc<Throwable>),
    /// Internal: a literal under construction.
    Stage(Rc<RefCell<LiteralStage>>),
}

impl CheapClone for Value {}

impl Value {
    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Function(_) | Value::Bound(_) | Value::Native(_) | Value::Continuation(_)
        )
    }

    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    /// Type name as reported by the `typeof` operator.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined | Value::DoubleMark => "undefined",
            Value::Null | Value::Object(_) | Value::Regex(_) | Value::Generator(_) => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::BigInt(_) => "bigint",
            Value::Function(_) | Value::Bound(_) | Value::Native(_) | Value::Continuation(_) => {
                "function"
            }
            Value::Throwable(_) | Value::Stage(_) => "internal",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::DoubleMark, Value::DoubleMark) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Regex(a), Value::Regex(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Bound(a), Value::Bound(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(&a.func, &b.func),
            (Value::Generator(a), Value::Generator(b)) => Rc::ptr_eq(a, b),
            (Value::Continuation(a), Value::Continuation(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::DoubleMark => write!(f, "DoubleMark"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::BigInt(b) => write!(f, "BigInt({b})"),
            Value::Regex(r) => write!(f, "Regex(/{}/)", r.source),
            Value::Object(_) => write!(f, "Object"),
            Value::Function(func) => write!(f, "Function({})", func.unit.name),
            Value::Bound(_) => write!(f, "Bound"),
            Value::Native(n) => write!(f, "Native({})", n.name),
            Value::Generator(_) => write!(f, "Generator"),
            Value::Continuation(_) => write!(f, "Continuation"),
            Value::Throwable(_) => write!(f, "Throwable"),
            Value::Stage(_) => write!(f, "Stage"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined | Value::DoubleMark => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{}", number_to_string(*n)),
            Value::Str(s) => write!(f, "{s}"),
            Value::BigInt(b) => write!(f, "{b}"),
            Value::Regex(r) => write!(f, "/{}/", r.source),
            Value::Object(_) => write!(f, "[object Object]"),
            Value::Function(func) => write!(f, "function {}() {{ ... }}", func.unit.name),
            Value::Bound(_) | Value::Native(_) | Value::Continuation(_) => {
                write!(f, "function () {{ ... }}")
            }
            Value::Generator(_) => write!(f, "[object Generator]"),
            Value::Throwable(_) => write!(f, "[internal throwable]"),
            Value::Stage(_) => write!(f, "[internal literal]"),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }
}

/// Format an f64 the way scripts expect: integral values print without a
/// fractional part, non-finite values by name.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// ToInt32 conversion (modular wrap into the signed 32-bit range).
pub fn to_int32(d: f64) -> i32 {
    to_uint32(d) as i32
}

/// ToUint32 conversion.
pub fn to_uint32(d: f64) -> u32 {
    if !d.is_finite() || d == 0.0 {
        return 0;
    }
    let two32 = 4_294_967_296.0;
    let d = d.trunc();
    let r = d % two32;
    let r = if r < 0.0 { r + two32 } else { r };
    r as u32
}

/// A numeric operand after ToNumeric coercion: either a double or a big
/// integer. The two never mix in one arithmetic operation.
pub enum Numeric {
    Double(f64),
    Big(Rc<BigInt>),
}

/// Arithmetic selector shared by the binary numeric instructions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArithOp {
    Sub,
    Mul,
    Div,
    Mod,
    Exp,
}

pub fn double_arith(op: ArithOp, l: f64, r: f64) -> f64 {
    match op {
        ArithOp::Sub => l - r,
        ArithOp::Mul => l * r,
        ArithOp::Div => l / r,
        ArithOp::Mod => l % r,
        ArithOp::Exp => l.powf(r),
    }
}

pub fn bigint_arith(op: ArithOp, l: &BigInt, r: &BigInt) -> Result<BigInt, VmError> {
    match op {
        ArithOp::Sub => Ok(l - r),
        ArithOp::Mul => Ok(l * r),
        ArithOp::Div => {
            if r.is_zero() {
                Err(VmError::range_error("division by zero"))
            } else {
                Ok(l / r)
            }
        }
        ArithOp::Mod => {
            if r.is_zero() {
                Err(VmError::range_error("division by zero"))
            } else {
                Ok(l % r)
            }
        }
        ArithOp::Exp => {
            if r.is_negative() {
                Err(VmError::range_error("negative exponent for bigint"))
            } else {
                let e = r
                    .to_u32()
                    .ok_or_else(|| VmError::range_error("bigint exponent too large"))?;
                Ok(l.pow(e))
            }
        }
    }
}

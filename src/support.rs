//! Runtime-support seam between the dispatch loop and the embedder
//!
//! The interpreter core never implements object-model or coercion
//! semantics. Every instruction that needs them calls through
//! [`RuntimeSupport`]; [`BasicHost`] is the bundled implementation used by
//! the tests and by embedders that do not bring their own object model.

use std::cell::RefCell;
use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::error::VmError;
use crate::value::{InterpFn, Numeric, ObjectData, ObjectRef, Value};

/// Capabilities the dispatch loop borrows from the embedder.
///
/// Implementations signal script-visible failures with the language error
/// variants (`Type`, `Range`, `Reference`, `Thrown`); those route through
/// catch handlers. `HostFault` marks infrastructure failures whose catch
/// visibility is governed by the interpreter's fault policy, and `Fatal`
/// always terminates the invocation.
pub trait RuntimeSupport {
    // coercions
    fn to_number(&self, v: &Value) -> Result<f64, VmError>;
    fn to_numeric(&self, v: &Value) -> Result<Numeric, VmError>;
    fn to_str(&self, v: &Value) -> Result<Rc<str>, VmError>;
    fn to_boolean(&self, v: &Value) -> bool;
    fn type_of(&self, v: &Value) -> &'static str;
    fn loose_eq(&self, a: &Value, b: &Value) -> Result<bool, VmError>;
    /// `+` when neither the all-numbers nor the string-concat fast path in
    /// the dispatch loop applies.
    fn add(&self, a: &Value, b: &Value) -> Result<Value, VmError>;

    // properties
    fn get_prop(&self, obj: &Value, name: &str) -> Result<Value, VmError>;
    fn set_prop(&self, obj: &Value, name: &str, value: Value) -> Result<Value, VmError>;
    fn get_elem(&self, obj: &Value, key: &Value) -> Result<Value, VmError>;
    fn set_elem(&self, obj: &Value, key: &Value, value: Value) -> Result<Value, VmError>;
    fn del_prop(&self, obj: &Value, key: &Value) -> Result<bool, VmError>;

    // names and scopes
    fn new_scope(&self) -> Value;
    /// Object in the scope chain that holds `name`, or the outermost scope
    /// when unbound.
    fn bind(&self, scope: &Value, name: &str) -> Result<Value, VmError>;
    fn name(&self, scope: &Value, name: &str) -> Result<Value, VmError>;
    fn set_name(&self, target: &Value, name: &str, value: Value) -> Result<Value, VmError>;
    fn type_of_name(&self, scope: &Value, name: &str) -> Result<&'static str, VmError>;
    fn new_catch_scope(&self, thrown: Value, scope: &Value, name: &str)
    -> Result<Value, VmError>;

    // activations
    fn create_activation(
        &self,
        func: &Rc<InterpFn>,
        args: &[Value],
        parent: &Value,
        home: Option<&Value>,
    ) -> Result<Value, VmError>;
    /// Re-entered when a frozen frame resumes, so the activation chain is
    /// replayed outermost-first.
    fn enter_activation(&self, _scope: &Value) {}
    fn exit_activation(&self) {}

    // construction
    fn new_object(&self) -> Value;
    fn new_array(&self, values: Vec<Value>) -> Value;
    fn fill_object_literal(
        &self,
        obj: &Value,
        keys: &[Rc<str>],
        values: Vec<Value>,
    ) -> Result<(), VmError>;
    fn new_instance(&self, func: &Rc<InterpFn>) -> Result<Value, VmError>;

    /// Convert an error into the value a catch handler binds.
    fn error_to_value(&self, err: &VmError) -> Value;
}

/// Default runtime support with a plain insertion-ordered object model.
#[derive(Default)]
pub struct BasicHost {
    activations: RefCell<Vec<Value>>,
}

impl BasicHost {
    pub fn new() -> Self {
        BasicHost::default()
    }

    pub fn activation_depth(&self) -> usize {
        self.activations.borrow().len()
    }

    fn object(data: ObjectData) -> Value {
        Value::Object(Rc::new(RefCell::new(data)))
    }

    fn as_object<'a>(v: &'a Value, what: &str) -> Result<&'a ObjectRef, VmError> {
        match v {
            Value::Object(o) => Ok(o),
            Value::Undefined | Value::Null => Err(VmError::type_error(format!(
                "cannot {what} of {}",
                if matches!(v, Value::Null) { "null" } else { "undefined" }
            ))),
            other => Err(VmError::type_error(format!(
                "cannot {what} of a {}",
                other.type_name()
            ))),
        }
    }

    fn prop_key(&self, key: &Value) -> Result<Rc<str>, VmError> {
        self.to_str(key)
    }
}

fn parse_number(s: &str) -> f64 {
    let t = s.trim();
    if t.is_empty() {
        return 0.0;
    }
    match t {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).map_or(f64::NAN, |n| n as f64);
    }
    t.parse::<f64>().unwrap_or(f64::NAN)
}

impl RuntimeSupport for BasicHost {
    fn to_number(&self, v: &Value) -> Result<f64, VmError> {
        match v {
            Value::Number(n) => Ok(*n),
            Value::Undefined => Ok(f64::NAN),
            Value::Null => Ok(0.0),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => Ok(parse_number(s)),
            Value::BigInt(_) => Err(VmError::type_error("cannot convert a bigint to a number")),
            Value::Object(_) | Value::Regex(_) | Value::Generator(_) => Ok(f64::NAN),
            Value::Function(_) | Value::Bound(_) | Value::Native(_) | Value::Continuation(_) => {
                Ok(f64::NAN)
            }
            Value::DoubleMark | Value::Throwable(_) | Value::Stage(_) => {
                Err(VmError::internal("internal value leaked into coercion"))
            }
        }
    }

    fn to_numeric(&self, v: &Value) -> Result<Numeric, VmError> {
        match v {
            Value::BigInt(b) => Ok(Numeric::Big(b.clone())),
            other => Ok(Numeric::Double(self.to_number(other)?)),
        }
    }

    fn to_str(&self, v: &Value) -> Result<Rc<str>, VmError> {
        match v {
            Value::Str(s) => Ok(s.clone()),
            Value::Throwable(_) | Value::Stage(_) | Value::DoubleMark => {
                Err(VmError::internal("internal value leaked into coercion"))
            }
            other => Ok(Rc::from(other.to_string().as_str())),
        }
    }

    fn to_boolean(&self, v: &Value) -> bool {
        match v {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::BigInt(b) => **b != BigInt::from(0),
            _ => true,
        }
    }

    fn type_of(&self, v: &Value) -> &'static str {
        v.type_name()
    }

    fn loose_eq(&self, a: &Value, b: &Value) -> Result<bool, VmError> {
        Ok(match (a, b) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::BigInt(x), Value::BigInt(y)) => x == y,
            (Value::BigInt(x), Value::Number(y)) | (Value::Number(y), Value::BigInt(x)) => {
                x.to_f64().is_some_and(|x| x == *y)
            }
            (Value::Number(_) | Value::Bool(_), Value::Str(_))
            | (Value::Str(_), Value::Number(_) | Value::Bool(_))
            | (Value::Bool(_), Value::Number(_))
            | (Value::Number(_), Value::Bool(_)) => self.to_number(a)? == self.to_number(b)?,
            _ => a == b,
        })
    }

    fn add(&self, a: &Value, b: &Value) -> Result<Value, VmError> {
        if matches!(a, Value::Str(_)) || matches!(b, Value::Str(_)) {
            let mut s = String::from(&*self.to_str(a)?);
            s.push_str(&self.to_str(b)?);
            return Ok(Value::str(s));
        }
        Ok(Value::Number(self.to_number(a)? + self.to_number(b)?))
    }

    fn get_prop(&self, obj: &Value, name: &str) -> Result<Value, VmError> {
        match obj {
            Value::Str(s) if name == "length" => Ok(Value::Number(s.chars().count() as f64)),
            Value::Regex(r) if name == "source" => Ok(Value::str(r.source.as_str())),
            Value::Regex(r) if name == "flags" => Ok(Value::str(r.flags.as_str())),
            Value::Str(_) | Value::Regex(_) | Value::Number(_) | Value::Bool(_) => {
                Ok(Value::Undefined)
            }
            other => {
                let obj = Self::as_object(other, &format!("read property '{name}'"))?;
                Ok(obj.borrow().props.get(name).cloned().unwrap_or_default())
            }
        }
    }

    fn set_prop(&self, obj: &Value, name: &str, value: Value) -> Result<Value, VmError> {
        let obj = Self::as_object(obj, &format!("set property '{name}'"))?;
        obj.borrow_mut().props.insert(Rc::from(name), value.clone());
        Ok(value)
    }

    fn get_elem(&self, obj: &Value, key: &Value) -> Result<Value, VmError> {
        let key = self.prop_key(key)?;
        self.get_prop(obj, &key)
    }

    fn set_elem(&self, obj: &Value, key: &Value, value: Value) -> Result<Value, VmError> {
        let key = self.prop_key(key)?;
        self.set_prop(obj, &key, value)
    }

    fn del_prop(&self, obj: &Value, key: &Value) -> Result<bool, VmError> {
        let key = self.prop_key(key)?;
        let obj = Self::as_object(obj, &format!("delete property '{key}'"))?;
        Ok(obj.borrow_mut().props.shift_remove(&*key).is_some())
    }

    fn new_scope(&self) -> Value {
        Self::object(ObjectData::new())
    }

    fn bind(&self, scope: &Value, name: &str) -> Result<Value, VmError> {
        let mut current = Self::as_object(scope, "bind a name in a scope")?.clone();
        loop {
            let next = {
                let data = current.borrow();
                if data.props.contains_key(name) {
                    return Ok(Value::Object(current.clone()));
                }
                data.parent.clone()
            };
            match next {
                Some(parent) => current = parent,
                // unbound names declare on the outermost scope
                None => return Ok(Value::Object(current)),
            }
        }
    }

    fn name(&self, scope: &Value, name: &str) -> Result<Value, VmError> {
        let mut current = Self::as_object(scope, "resolve a name in a scope")?.clone();
        loop {
            let next = {
                let data = current.borrow();
                if let Some(v) = data.props.get(name) {
                    return Ok(v.clone());
                }
                data.parent.clone()
            };
            match next {
                Some(parent) => current = parent,
                None => return Err(VmError::reference_error(name)),
            }
        }
    }

    fn set_name(&self, target: &Value, name: &str, value: Value) -> Result<Value, VmError> {
        self.set_prop(target, name, value)
    }

    fn type_of_name(&self, scope: &Value, name: &str) -> Result<&'static str, VmError> {
        let mut current = Self::as_object(scope, "resolve a name in a scope")?.clone();
        loop {
            let next = {
                let data = current.borrow();
                if let Some(v) = data.props.get(name) {
                    return Ok(v.type_name());
                }
                data.parent.clone()
            };
            match next {
                Some(parent) => current = parent,
                None => return Ok("undefined"),
            }
        }
    }

    fn new_catch_scope(
        &self,
        thrown: Value,
        scope: &Value,
        name: &str,
    ) -> Result<Value, VmError> {
        let parent = Self::as_object(scope, "open a catch scope")?.clone();
        let mut data = ObjectData::with_parent(parent);
        data.props.insert(Rc::from(name), thrown);
        Ok(Self::object(data))
    }

    fn create_activation(
        &self,
        _func: &Rc<InterpFn>,
        args: &[Value],
        parent: &Value,
        _home: Option<&Value>,
    ) -> Result<Value, VmError> {
        let parent = Self::as_object(parent, "create an activation")?.clone();
        let mut data = ObjectData::with_parent(parent);
        data.props
            .insert(Rc::from("arguments"), self.new_array(args.to_vec()));
        Ok(Self::object(data))
    }

    fn enter_activation(&self, scope: &Value) {
        self.activations.borrow_mut().push(scope.clone());
    }

    fn exit_activation(&self) {
        self.activations.borrow_mut().pop();
    }

    fn new_object(&self) -> Value {
        Self::object(ObjectData::new())
    }

    fn new_array(&self, values: Vec<Value>) -> Value {
        let mut data = ObjectData::new();
        let len = values.len();
        for (i, v) in values.into_iter().enumerate() {
            data.props.insert(Rc::from(i.to_string().as_str()), v);
        }
        data.props
            .insert(Rc::from("length"), Value::Number(len as f64));
        Self::object(data)
    }

    fn fill_object_literal(
        &self,
        obj: &Value,
        keys: &[Rc<str>],
        values: Vec<Value>,
    ) -> Result<(), VmError> {
        if keys.len() != values.len() {
            return Err(VmError::internal(format!(
                "object literal arity mismatch: {} keys, {} values",
                keys.len(),
                values.len()
            )));
        }
        let obj = Self::as_object(obj, "fill an object literal")?;
        let mut data = obj.borrow_mut();
        for (k, v) in keys.iter().zip(values) {
            data.props.insert(k.clone(), v);
        }
        Ok(())
    }

    fn new_instance(&self, _func: &Rc<InterpFn>) -> Result<Value, VmError> {
        Ok(Self::object(ObjectData::new()))
    }

    fn error_to_value(&self, err: &VmError) -> Value {
        match err {
            VmError::Thrown { value, .. } => value.clone(),
            other => Value::str(other.to_string().as_str()),
        }
    }
}

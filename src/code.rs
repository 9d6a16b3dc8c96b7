//! Compiled code units and the builder that assembles them
//!
//! A [`CompiledUnit`] is the immutable product of compilation: a flat
//! instruction stream plus constant pools, the exception table, and frame
//! sizing metadata. Units are freely shared between frames and serialize
//! with `serde` for caching.

use std::fmt::Write as _;
use std::rc::Rc;

use fancy_regex::Regex;
use num_bigint::BigInt;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::VmError;
use crate::opcode::Op;

/// Opaque execution-domain token. Frames created from units with different
/// tokens never share a dispatch loop; the call sequence routes across the
/// boundary through a fresh host-level invocation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct DomainToken(pub u64);

/// A compiled regular expression literal. Only the pattern text is
/// serialized; the program recompiles on load.
#[derive(Debug)]
pub struct RegexLiteral {
    pub source: String,
    pub flags: String,
    pub compiled: Regex,
}

impl RegexLiteral {
    pub fn new(source: impl Into<String>, flags: impl Into<String>) -> Result<Self, VmError> {
        let source = source.into();
        let flags = flags.into();
        let mut inline = String::new();
        for f in flags.chars() {
            match f {
                'i' => inline.push('i'),
                'm' => inline.push('m'),
                's' => inline.push('s'),
                // matching mode flags with no pattern-level equivalent
                'g' | 'u' | 'y' => {}
                other => {
                    return Err(VmError::syntax_error(format!(
                        "unsupported regex flag '{other}'"
                    )));
                }
            }
        }
        let pattern = if inline.is_empty() {
            source.clone()
        } else {
            format!("(?{inline}){source}")
        };
        let compiled = Regex::new(&pattern)
            .map_err(|e| VmError::syntax_error(format!("invalid regex /{source}/: {e}")))?;
        Ok(RegexLiteral {
            source,
            flags,
            compiled,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct RegexRepr {
    source: String,
    flags: String,
}

impl Serialize for RegexLiteral {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RegexRepr {
            source: self.source.clone(),
            flags: self.flags.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RegexLiteral {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = RegexRepr::deserialize(deserializer)?;
        RegexLiteral::new(repr.source, repr.flags).map_err(serde::de::Error::custom)
    }
}

/// One guarded region of the exception table.
///
/// The pc range `[try_start, try_end)` is half-open. Regions from one unit
/// nest properly and never share an end offset, so the innermost region
/// enclosing a pc is the one with the largest start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub try_start: u32,
    pub try_end: u32,
    pub handler_pc: u32,
    /// Cleanup handler: runs for every routable fault, including those a
    /// catch handler must not observe.
    pub is_finally: bool,
    /// Frame local receiving the in-flight throwable.
    pub exception_slot: u16,
    /// Frame local holding the scope to restore on entry to the handler.
    pub scope_slot: u16,
}

/// Immutable compiled form of one function or script.
#[derive(Debug, Serialize, Deserialize)]
pub struct CompiledUnit {
    pub name: Rc<str>,
    pub source_file: Rc<str>,
    pub icode: Vec<u8>,
    pub strings: Vec<Rc<str>>,
    pub doubles: Vec<f64>,
    pub big_ints: Vec<Rc<BigInt>>,
    pub regexps: Vec<Rc<RegexLiteral>>,
    /// Key lists for object literals, one entry per `LiteralNewObject` site.
    pub literal_keys: Vec<Rc<Vec<Rc<str>>>>,
    pub nested: Vec<Rc<CompiledUnit>>,
    pub exception_table: Vec<ExceptionRecord>,
    /// Branch targets that did not fit the inline two-byte offset, keyed by
    /// the pc of the operand.
    pub long_jumps: FxHashMap<usize, usize>,
    pub param_count: usize,
    /// The last parameter is a rest parameter collecting surplus arguments
    /// into an array.
    pub args_has_rest: bool,
    /// Parameters plus declared variables; the vars zone of the frame array.
    pub param_and_var_count: usize,
    pub const_vars: Vec<bool>,
    pub max_locals: usize,
    pub max_stack: usize,
    /// Total frame array length: vars + locals + sentinel + operand stack.
    pub max_frame_array: usize,
    pub is_script: bool,
    pub needs_activation: bool,
    pub first_line: Option<u32>,
    pub domain: DomainToken,
}

impl CompiledUnit {
    /// Sign-extended two-byte operand.
    pub fn get_short(&self, pc: usize) -> i32 {
        ((self.icode[pc] as i8 as i32) << 8) | self.icode[pc + 1] as i32
    }

    /// Unsigned two-byte operand.
    pub fn get_index(&self, pc: usize) -> usize {
        ((self.icode[pc] as usize) << 8) | self.icode[pc + 1] as usize
    }

    /// Signed four-byte operand.
    pub fn get_int(&self, pc: usize) -> i32 {
        i32::from_be_bytes([
            self.icode[pc],
            self.icode[pc + 1],
            self.icode[pc + 2],
            self.icode[pc + 3],
        ])
    }

    pub fn string(&self, i: usize) -> Result<Rc<str>, VmError> {
        self.strings.get(i).cloned().ok_or_else(|| pool_err("string", i))
    }

    pub fn double(&self, i: usize) -> Result<f64, VmError> {
        self.doubles.get(i).copied().ok_or_else(|| pool_err("double", i))
    }

    pub fn big_int(&self, i: usize) -> Result<Rc<BigInt>, VmError> {
        self.big_ints.get(i).cloned().ok_or_else(|| pool_err("bigint", i))
    }

    pub fn regexp(&self, i: usize) -> Result<Rc<RegexLiteral>, VmError> {
        self.regexps.get(i).cloned().ok_or_else(|| pool_err("regexp", i))
    }

    pub fn keys(&self, i: usize) -> Result<Rc<Vec<Rc<str>>>, VmError> {
        self.literal_keys
            .get(i)
            .cloned()
            .ok_or_else(|| pool_err("literal keys", i))
    }

    pub fn nested_unit(&self, i: usize) -> Result<Rc<CompiledUnit>, VmError> {
        self.nested.get(i).cloned().ok_or_else(|| pool_err("nested unit", i))
    }

    /// Index of the innermost exception record covering `pc`, if any.
    /// With `only_finally` set, catch records are skipped entirely.
    pub fn exception_handler_index(&self, pc: u32, only_finally: bool) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, rec) in self.exception_table.iter().enumerate() {
            if pc < rec.try_start || pc >= rec.try_end {
                continue;
            }
            if only_finally && !rec.is_finally {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b) => {
                    let prev = &self.exception_table[b];
                    if rec.try_start > prev.try_start
                        || (rec.try_start == prev.try_start && rec.try_end < prev.try_end)
                    {
                        Some(i)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        best
    }

    /// Human-readable instruction listing, mostly for tests and debugging.
    pub fn disassemble(&self) -> Result<String, VmError> {
        let mut out = String::new();
        let mut pc = 0;
        while pc < self.icode.len() {
            let op = Op::from_byte(self.icode[pc])?;
            let _ = write!(out, "{pc:5}  {}", op.name());
            let operand_pc = pc + 1;
            match op.operand_span() {
                0 => {}
                1 => {
                    let _ = write!(out, " {}", self.icode[operand_pc]);
                }
                2 if op.is_branch() => {
                    let off = self.get_short(operand_pc);
                    let target = if off == 0 {
                        self.long_jumps.get(&operand_pc).copied().ok_or_else(|| {
                            VmError::internal(format!("missing long jump at pc {operand_pc}"))
                        })?
                    } else {
                        (pc as i64 + off as i64) as usize
                    };
                    let _ = write!(out, " -> {target}");
                }
                2 => {
                    let _ = write!(out, " {}", self.get_index(operand_pc));
                }
                4 => {
                    let _ = write!(out, " {}", self.get_int(operand_pc));
                }
                n => {
                    return Err(VmError::internal(format!(
                        "unexpected operand span {n} for {}",
                        op.name()
                    )));
                }
            }
            out.push('\n');
            pc = operand_pc + op.operand_span();
        }
        Ok(out)
    }
}

fn pool_err(pool: &str, i: usize) -> VmError {
    VmError::internal(format!("{pool} pool index {i} out of range"))
}

/// A forward-patchable branch target handed out by [`CodeBuilder`].
#[derive(Clone, Copy, Debug)]
pub struct Label(usize);

struct GuardedRange {
    start: Label,
    end: Label,
    handler: Label,
    is_finally: bool,
    exception_slot: u16,
    scope_slot: u16,
}

/// Incremental assembler for a [`CompiledUnit`].
///
/// Emission is linear; branches go through [`Label`]s that may be bound
/// before or after the jump is emitted. Offsets that overflow the inline
/// two-byte form are spilled to the long-jump table at build time.
pub struct CodeBuilder {
    name: Rc<str>,
    source_file: Rc<str>,
    icode: Vec<u8>,
    strings: Vec<Rc<str>>,
    string_ids: FxHashMap<Rc<str>, usize>,
    doubles: Vec<f64>,
    big_ints: Vec<Rc<BigInt>>,
    regexps: Vec<Rc<RegexLiteral>>,
    literal_keys: Vec<Rc<Vec<Rc<str>>>>,
    nested: Vec<Rc<CompiledUnit>>,
    guarded: Vec<GuardedRange>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
    param_count: usize,
    args_has_rest: bool,
    param_and_var_count: usize,
    const_vars: Vec<bool>,
    max_locals: usize,
    max_stack: usize,
    stack_depth: usize,
    computed_max_stack: usize,
    /// Last value fed through the index register, for call arity tracking.
    argc_reg: usize,
    is_script: bool,
    needs_activation: bool,
    first_line: Option<u32>,
    domain: DomainToken,
}

impl CodeBuilder {
    pub fn new(name: impl Into<Rc<str>>, source_file: impl Into<Rc<str>>) -> Self {
        CodeBuilder {
            name: name.into(),
            source_file: source_file.into(),
            icode: Vec::new(),
            strings: Vec::new(),
            string_ids: FxHashMap::default(),
            doubles: Vec::new(),
            big_ints: Vec::new(),
            regexps: Vec::new(),
            literal_keys: Vec::new(),
            nested: Vec::new(),
            guarded: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            param_count: 0,
            args_has_rest: false,
            param_and_var_count: 0,
            const_vars: Vec::new(),
            max_locals: 0,
            max_stack: 8,
            stack_depth: 0,
            computed_max_stack: 0,
            argc_reg: 0,
            is_script: false,
            needs_activation: false,
            first_line: None,
            domain: DomainToken::default(),
        }
    }

    /// Declare the vars zone: `param_count` parameters followed by
    /// `var_count` additional variables.
    pub fn params_and_vars(&mut self, param_count: usize, var_count: usize) -> &mut Self {
        self.param_count = param_count;
        self.param_and_var_count = param_count + var_count;
        self.const_vars = vec![false; self.param_and_var_count];
        self
    }

    /// Declare the last parameter as a rest parameter: surplus arguments
    /// past the other parameters are collected into an array.
    pub fn rest_parameter(&mut self) -> &mut Self {
        self.args_has_rest = true;
        self
    }

    pub fn mark_const_var(&mut self, index: usize) -> &mut Self {
        if let Some(slot) = self.const_vars.get_mut(index) {
            *slot = true;
        }
        self
    }

    pub fn locals(&mut self, n: usize) -> &mut Self {
        self.max_locals = n;
        self
    }

    /// Declare a floor for the operand-stack zone. The builder also tracks
    /// the stack effect of every emitted instruction, and `build` sizes the
    /// zone to whichever is larger.
    pub fn stack(&mut self, n: usize) -> &mut Self {
        self.max_stack = n;
        self
    }

    pub fn script(&mut self) -> &mut Self {
        self.is_script = true;
        self
    }

    pub fn activation(&mut self) -> &mut Self {
        self.needs_activation = true;
        self
    }

    pub fn domain(&mut self, token: DomainToken) -> &mut Self {
        self.domain = token;
        self
    }

    pub fn current_pc(&self) -> usize {
        self.icode.len()
    }

    /// Apply an instruction's stack effect to the running depth. Emission
    /// order approximates execution order, so the running maximum bounds the
    /// operand stack on every path.
    fn track(&mut self, op: Op) {
        use Op::*;
        let delta: isize = match op {
            Zero | One | ShortNumber | IntNumber | Number | String | BigInt | Regex | True
            | False | Null | Undef | This | ThisFn | Dup | GetVar | GetVar1 | VarIncDec
            | LocalLoad | Name | BindName | TypeofName | Closure | LiteralNewObject
            | LiteralNewArray | Gosub => 1,
            Dup2 => 2,
            Pop | PopResult | Add | Sub | Mul | Div | Mod | Exp | BitAnd | BitOr | BitXor
            | Lsh | Rsh | Ursh | Lt | Le | Gt | Ge | Eq | Ne | StrictEq | StrictNe | SetName
            | SetProp | GetElem | DelProp | LiteralSet | StartSub | IfTrue | IfFalse
            | CatchScope | Return | Throw | GeneratorReturn => -1,
            SetElem | IfFalsePop => -2,
            Call | TailCall => -(self.argc_reg as isize + 1),
            New => -(self.argc_reg as isize),
            _ => 0,
        };
        self.stack_depth = self.stack_depth.saturating_add_signed(delta);
        if self.stack_depth > self.computed_max_stack {
            self.computed_max_stack = self.stack_depth;
        }
    }

    /// Emit an instruction with no inline operand.
    pub fn emit(&mut self, op: Op) -> &mut Self {
        debug_assert_eq!(op.operand_span(), 0, "{} takes an operand", op.name());
        self.track(op);
        self.icode.push(op as u8);
        self
    }

    /// Emit an instruction with a one-byte operand.
    pub fn emit_byte(&mut self, op: Op, operand: u8) -> &mut Self {
        debug_assert_eq!(op.operand_span(), 1, "{} operand width", op.name());
        if op == Op::RegInd1 {
            self.argc_reg = operand as usize;
        }
        self.track(op);
        self.icode.push(op as u8);
        self.icode.push(operand);
        self
    }

    fn emit_u16(&mut self, op: Op, operand: u16) -> &mut Self {
        if op == Op::RegInd2 {
            self.argc_reg = operand as usize;
        }
        self.track(op);
        self.icode.push(op as u8);
        self.icode.extend_from_slice(&operand.to_be_bytes());
        self
    }

    pub fn emit_line(&mut self, line: u16) -> &mut Self {
        if self.first_line.is_none() {
            self.first_line = Some(line as u32);
        }
        self.emit_u16(Op::Line, line)
    }

    /// Emit an instruction that carries its source line inline (`Throw` and
    /// the generator suspension opcodes).
    pub fn emit_at_line(&mut self, op: Op, line: u16) -> &mut Self {
        debug_assert_eq!(op.operand_span(), 2, "{} operand width", op.name());
        self.emit_u16(op, line)
    }

    /// Load an index into the register feeding the next instruction, using
    /// the narrowest encoding.
    pub fn index(&mut self, i: usize) -> &mut Self {
        if i <= u8::MAX as usize {
            self.emit_byte(Op::RegInd1, i as u8)
        } else if i <= u16::MAX as usize {
            self.emit_u16(Op::RegInd2, i as u16)
        } else {
            self.argc_reg = i;
            self.icode.push(Op::RegInd4 as u8);
            self.icode.extend_from_slice(&(i as u32).to_be_bytes());
            self
        }
    }

    fn intern(&mut self, s: impl Into<Rc<str>>) -> usize {
        let s: Rc<str> = s.into();
        if let Some(&id) = self.string_ids.get(&s) {
            return id;
        }
        let id = self.strings.len();
        self.strings.push(s.clone());
        self.string_ids.insert(s, id);
        id
    }

    /// Load a pooled string into the string register.
    pub fn string_reg(&mut self, s: impl Into<Rc<str>>) -> &mut Self {
        let id = self.intern(s);
        if id <= u8::MAX as usize {
            self.emit_byte(Op::RegStr1, id as u8)
        } else if id <= u16::MAX as usize {
            self.emit_u16(Op::RegStr2, id as u16)
        } else {
            self.track(Op::RegStr4);
            self.icode.push(Op::RegStr4 as u8);
            self.icode.extend_from_slice(&(id as u32).to_be_bytes());
            self
        }
    }

    /// Push a string constant on the operand stack.
    pub fn load_string(&mut self, s: impl Into<Rc<str>>) -> &mut Self {
        self.string_reg(s).emit(Op::String)
    }

    /// Push a big integer constant on the operand stack.
    pub fn load_big_int(&mut self, b: BigInt) -> &mut Self {
        let id = self.big_ints.len();
        self.big_ints.push(Rc::new(b));
        if id <= u8::MAX as usize {
            self.emit_byte(Op::RegBigInt1, id as u8);
        } else {
            self.emit_u16(Op::RegBigInt2, id as u16);
        }
        self.emit(Op::BigInt)
    }

    /// Push a number constant, choosing the shortest encoding.
    pub fn load_number(&mut self, n: f64) -> &mut Self {
        if n == 0.0 && n.is_sign_positive() {
            return self.emit(Op::Zero);
        }
        if n == 1.0 {
            return self.emit(Op::One);
        }
        if n.fract() == 0.0 {
            let i = n as i64;
            if i as f64 == n {
                if let Ok(short) = i16::try_from(i) {
                    return self.emit_u16(Op::ShortNumber, short as u16);
                }
                if let Ok(int) = i32::try_from(i) {
                    self.track(Op::IntNumber);
                    self.icode.push(Op::IntNumber as u8);
                    self.icode.extend_from_slice(&int.to_be_bytes());
                    return self;
                }
            }
        }
        let id = self.doubles.len();
        self.doubles.push(n);
        self.index(id).emit(Op::Number)
    }

    /// Push a regex literal on the operand stack.
    pub fn load_regex(&mut self, source: &str, flags: &str) -> Result<&mut Self, VmError> {
        let id = self.regexps.len();
        self.regexps.push(Rc::new(RegexLiteral::new(source, flags)?));
        Ok(self.index(id).emit(Op::Regex))
    }

    /// Pool the key list for an object literal; returns its pool index.
    pub fn object_keys(&mut self, keys: &[&str]) -> usize {
        let id = self.literal_keys.len();
        self.literal_keys
            .push(Rc::new(keys.iter().map(|k| Rc::from(*k)).collect()));
        id
    }

    /// Pool a nested unit for `Closure`; returns its pool index.
    pub fn nested(&mut self, unit: Rc<CompiledUnit>) -> usize {
        let id = self.nested.len();
        self.nested.push(unit);
        id
    }

    pub fn label(&mut self) -> Label {
        let id = self.labels.len();
        self.labels.push(None);
        Label(id)
    }

    /// Bind a label to the current pc.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.icode.len());
        self
    }

    /// Emit a branch instruction targeting `label`.
    pub fn emit_jump(&mut self, op: Op, label: Label) -> &mut Self {
        debug_assert!(op.is_branch(), "{} is not a branch", op.name());
        self.track(op);
        self.icode.push(op as u8);
        self.fixups.push((self.icode.len(), label));
        self.icode.extend_from_slice(&[0, 0]);
        self
    }

    /// Record a guarded region of the exception table. Ranges may be added
    /// in any order; nesting is validated at build time.
    pub fn guarded_region(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        is_finally: bool,
        exception_slot: u16,
        scope_slot: u16,
    ) -> &mut Self {
        self.guarded.push(GuardedRange {
            start,
            end,
            handler,
            is_finally,
            exception_slot,
            scope_slot,
        });
        self
    }

    fn resolve(&self, label: Label) -> Result<usize, VmError> {
        self.labels[label.0]
            .ok_or_else(|| VmError::Builder(format!("label {} never bound", label.0)))
    }

    pub fn build(self) -> Result<Rc<CompiledUnit>, VmError> {
        if self.args_has_rest && self.param_count == 0 {
            return Err(VmError::Builder(
                "a rest parameter requires at least one declared parameter".to_string(),
            ));
        }
        let mut icode = self.icode.clone();
        let mut long_jumps = FxHashMap::default();
        for &(operand_pc, label) in &self.fixups {
            let target = self.resolve(label)?;
            let offset = target as i64 - (operand_pc as i64 - 1);
            match i16::try_from(offset) {
                Ok(short) if short != 0 => {
                    icode[operand_pc..operand_pc + 2].copy_from_slice(&short.to_be_bytes());
                }
                _ => {
                    long_jumps.insert(operand_pc, target);
                }
            }
        }

        let mut exception_table = Vec::with_capacity(self.guarded.len());
        for range in &self.guarded {
            let try_start = self.resolve(range.start)? as u32;
            let try_end = self.resolve(range.end)? as u32;
            let handler_pc = self.resolve(range.handler)? as u32;
            if try_start >= try_end {
                return Err(VmError::Builder(format!(
                    "empty guarded region [{try_start}, {try_end})"
                )));
            }
            if range.exception_slot as usize >= self.max_locals
                || range.scope_slot as usize >= self.max_locals
            {
                return Err(VmError::Builder(
                    "guarded region slot outside the locals zone".to_string(),
                ));
            }
            exception_table.push(ExceptionRecord {
                try_start,
                try_end,
                handler_pc,
                is_finally: range.is_finally,
                exception_slot: range.exception_slot,
                scope_slot: range.scope_slot,
            });
        }
        validate_nesting(&exception_table)?;

        let max_stack = self.max_stack.max(self.computed_max_stack);
        // one extra slot: the stack-empty sentinel between locals and stack
        let max_frame_array = self.param_and_var_count + self.max_locals + max_stack + 1;
        Ok(Rc::new(CompiledUnit {
            name: self.name,
            source_file: self.source_file,
            icode,
            strings: self.strings,
            doubles: self.doubles,
            big_ints: self.big_ints,
            regexps: self.regexps,
            literal_keys: self.literal_keys,
            nested: self.nested,
            exception_table,
            long_jumps,
            param_count: self.param_count,
            args_has_rest: self.args_has_rest,
            param_and_var_count: self.param_and_var_count,
            const_vars: self.const_vars,
            max_locals: self.max_locals,
            max_stack,
            max_frame_array,
            is_script: self.is_script,
            needs_activation: self.needs_activation,
            first_line: self.first_line,
            domain: self.domain,
        }))
    }
}

/// Regions must nest properly: any two either are disjoint or one contains
/// the other, and no two share an end offset.
fn validate_nesting(table: &[ExceptionRecord]) -> Result<(), VmError> {
    for (i, a) in table.iter().enumerate() {
        for b in &table[i + 1..] {
            if a.try_end == b.try_end {
                return Err(VmError::Builder(format!(
                    "guarded regions share end offset {}",
                    a.try_end
                )));
            }
            let disjoint = a.try_end <= b.try_start || b.try_end <= a.try_start;
            let a_in_b = b.try_start <= a.try_start && a.try_end <= b.try_end;
            let b_in_a = a.try_start <= b.try_start && b.try_end <= a.try_end;
            if !(disjoint || a_in_b || b_in_a) {
                return Err(VmError::Builder(format!(
                    "guarded regions [{}, {}) and [{}, {}) overlap without nesting",
                    a.try_start, a.try_end, b.try_start, b.try_end
                )));
            }
        }
    }
    Ok(())
}

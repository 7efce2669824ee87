//! Cranelift IR generation for expressions and tuple deformers.
//!
//! # Calling conventions
//!
//! Expression functions take a single parameter, a pointer to an array of row
//! pointers (`*const *const i64`), and return one `i64` slot. Field access is two
//! loads:
//!
//! ```text
//! row_ptr = load(base + param_idx * ptr_size)  // once per row, in the entry block
//! value   = load(row_ptr + field_idx * 8)
//! ```
//!
//! Deform functions take the raw row and an output slot array
//! (`fn(*const u8, *mut i64)`), and decode every attribute at its fixed offset.
//!
//! Native calls spill their arguments to a stack array and pass its address and
//! length, matching [`kiln_core::NativeFn`].

use std::collections::HashMap;

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::types::I64;
use cranelift_codegen::ir::{
    AbiParam, FuncRef, Function, InstBuilder, MemFlags, Signature, StackSlotData, StackSlotKind,
    Type, UserFuncName, Value,
};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module, ModuleError};
use kiln_core::{AttrType, Definition, Expr, NativeSymbols, TupleDesc, NULL_SENTINEL};
use kiln_jit::JitError;
use thiserror::Error;

/// Bytes per slot.
const SLOT: i32 = 8;

#[derive(Debug, Error)]
pub(crate) enum CodegenError {
    #[error("module: {0}")]
    Module(Box<ModuleError>),

    #[error("ISA: {0}")]
    Isa(String),

    #[error("codegen: {0}")]
    Codegen(String),
}

impl From<ModuleError> for CodegenError {
    fn from(e: ModuleError) -> Self {
        CodegenError::Module(Box::new(e))
    }
}

impl From<CodegenError> for JitError {
    fn from(e: CodegenError) -> Self {
        JitError::materialization(e.to_string())
    }
}

/// Creates a JIT module for the host, linking every native function by name.
pub(crate) fn make_jit_module(
    optimize: bool,
    natives: &NativeSymbols,
) -> Result<JITModule, CodegenError> {
    let mut flag_builder = settings::builder();
    let opt_level = if optimize { "speed" } else { "none" };
    for (name, value) in [
        ("use_colocated_libcalls", "false"),
        ("is_pic", "false"),
        ("opt_level", opt_level),
    ] {
        flag_builder
            .set(name, value)
            .map_err(|e| CodegenError::Isa(format!("{name}={value}: {e}")))?;
    }
    let isa_builder = cranelift_native::builder().map_err(|e| CodegenError::Isa(e.to_string()))?;
    let isa = isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(|e| CodegenError::Isa(e.to_string()))?;

    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    for (name, native) in natives.iter() {
        builder.symbol(name, native.address());
    }
    Ok(JITModule::new(builder))
}

pub(crate) fn signature_for(module: &JITModule, definition: &Definition) -> Signature {
    let ptr_type = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    match definition {
        Definition::Expr { .. } => {
            sig.params.push(AbiParam::new(ptr_type));
            sig.returns.push(AbiParam::new(I64));
        }
        Definition::Deform(_) => {
            sig.params.push(AbiParam::new(ptr_type));
            sig.params.push(AbiParam::new(ptr_type));
        }
    }
    sig
}

fn native_signature(module: &JITModule) -> Signature {
    let ptr_type = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(ptr_type));
    sig.params.push(AbiParam::new(ptr_type));
    sig.returns.push(AbiParam::new(I64));
    sig
}

/// Builds the IR for `definition` as function `func_id`.
pub(crate) fn build_function(
    module: &mut JITModule,
    natives: &NativeSymbols,
    definition: &Definition,
    func_id: FuncId,
) -> Result<Function, CodegenError> {
    let sig = signature_for(module, definition);
    let mut func = Function::with_name_signature(UserFuncName::user(0, func_id.as_u32()), sig);
    let mut func_ctx = FunctionBuilderContext::new();
    match definition {
        Definition::Expr { expr, arity } => {
            build_expr(module, natives, expr, *arity, &mut func, &mut func_ctx)?
        }
        Definition::Deform(desc) => build_deform(desc, &mut func, &mut func_ctx),
    }
    Ok(func)
}

fn build_expr(
    module: &mut JITModule,
    natives: &NativeSymbols,
    expr: &Expr,
    arity: usize,
    func: &mut Function,
    func_ctx: &mut FunctionBuilderContext,
) -> Result<(), CodegenError> {
    let ptr_type = module.target_config().pointer_type();
    let mut builder = FunctionBuilder::new(func, func_ctx);
    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    builder.seal_block(entry);

    let base_ptr = builder.block_params(entry)[0];
    let ptr_size = ptr_type.bytes() as i32;
    let rows = (0..arity)
        .map(|i| {
            builder
                .ins()
                .load(ptr_type, MemFlags::trusted(), base_ptr, i as i32 * ptr_size)
        })
        .collect();

    let mut emitter = ExprEmitter {
        module,
        natives,
        rows,
        ptr_type,
        callees: HashMap::new(),
    };
    let result = emitter.emit(&mut builder, expr)?;
    builder.ins().return_(&[result]);
    builder.finalize();
    Ok(())
}

fn build_deform(desc: &TupleDesc, func: &mut Function, func_ctx: &mut FunctionBuilderContext) {
    let mut builder = FunctionBuilder::new(func, func_ctx);
    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    builder.seal_block(entry);

    let row = builder.block_params(entry)[0];
    let out = builder.block_params(entry)[1];
    // Row bytes are packed and possibly unaligned; output slots are not.
    let row_flags = MemFlags::new();
    let out_flags = MemFlags::trusted();

    for ((i, attr), offset) in desc.attrs.iter().enumerate().zip(desc.offsets()) {
        let offset = offset as i32;
        let raw = match attr.ty {
            AttrType::Bool => {
                let byte = builder.ins().uload8(I64, row_flags, row, offset);
                let set = builder.ins().icmp_imm(IntCC::NotEqual, byte, 0);
                builder.ins().uextend(I64, set)
            }
            AttrType::Int2 => builder.ins().sload16(I64, row_flags, row, offset),
            AttrType::Int4 => builder.ins().sload32(row_flags, row, offset),
            AttrType::Int8 => builder.ins().load(I64, row_flags, row, offset),
        };
        let value = if attr.nullable {
            let bits = builder.ins().uload8(I64, row_flags, row, (i / 8) as i32);
            let is_null = builder.ins().band_imm(bits, 1i64 << (i % 8));
            let null = builder.ins().iconst(I64, NULL_SENTINEL);
            builder.ins().select(is_null, null, raw)
        } else {
            raw
        };
        builder
            .ins()
            .store(out_flags, value, out, i as i32 * SLOT);
    }
    builder.ins().return_(&[]);
    builder.finalize();
}

struct ExprEmitter<'a> {
    module: &'a mut JITModule,
    natives: &'a NativeSymbols,
    rows: Vec<Value>,
    ptr_type: Type,
    callees: HashMap<String, FuncRef>,
}

impl ExprEmitter<'_> {
    /// Emits IR for `expr`. All values are i64; booleans are 0 or 1.
    fn emit(&mut self, b: &mut FunctionBuilder, expr: &Expr) -> Result<Value, CodegenError> {
        use Expr::*;
        let value = match expr {
            Literal(d) => b.ins().iconst(I64, d.to_slot()),

            Field {
                param_idx,
                field_idx,
            } => {
                let row = *self.rows.get(*param_idx).ok_or_else(|| {
                    CodegenError::Codegen(format!(
                        "field of row {param_idx} but the function takes {} rows",
                        self.rows.len()
                    ))
                })?;
                b.ins()
                    .load(I64, MemFlags::trusted(), row, *field_idx as i32 * SLOT)
            }

            Arg(i) => {
                return Err(CodegenError::Codegen(format!(
                    "unbound argument Arg({i})"
                )))
            }

            Eq(l, r) => self.icmp(b, IntCC::Equal, l, r)?,
            Ne(l, r) => self.icmp(b, IntCC::NotEqual, l, r)?,
            Lt(l, r) => self.icmp(b, IntCC::SignedLessThan, l, r)?,
            Le(l, r) => self.icmp(b, IntCC::SignedLessThanOrEqual, l, r)?,
            Gt(l, r) => self.icmp(b, IntCC::SignedGreaterThan, l, r)?,
            Ge(l, r) => self.icmp(b, IntCC::SignedGreaterThanOrEqual, l, r)?,

            And(l, r) => self.binary(b, l, r, |b, x, y| b.ins().band(x, y))?,
            Or(l, r) => self.binary(b, l, r, |b, x, y| b.ins().bor(x, y))?,
            Not(inner) => {
                let v = self.emit(b, inner)?;
                b.ins().bxor_imm(v, 1)
            }

            Add(l, r) => self.binary(b, l, r, |b, x, y| b.ins().iadd(x, y))?,
            Sub(l, r) => self.binary(b, l, r, |b, x, y| b.ins().isub(x, y))?,
            Mul(l, r) => self.binary(b, l, r, |b, x, y| b.ins().imul(x, y))?,
            Div(l, r) => self.checked_div(b, l, r, false)?,
            Mod(l, r) => self.checked_div(b, l, r, true)?,
            Neg(inner) => {
                let v = self.emit(b, inner)?;
                b.ins().ineg(v)
            }
            Abs(inner) => {
                let v = self.emit(b, inner)?;
                let neg = b.ins().ineg(v);
                let is_neg = b.ins().icmp_imm(IntCC::SignedLessThan, v, 0);
                b.ins().select(is_neg, neg, v)
            }

            Min(l, r) => self.select_op(b, IntCC::SignedLessThan, l, r)?,
            Max(l, r) => self.select_op(b, IntCC::SignedGreaterThan, l, r)?,

            IsNull(inner) => {
                let v = self.emit(b, inner)?;
                let cmp = b.ins().icmp_imm(IntCC::Equal, v, NULL_SENTINEL);
                b.ins().uextend(I64, cmp)
            }
            IsNotNull(inner) => {
                let v = self.emit(b, inner)?;
                let cmp = b.ins().icmp_imm(IntCC::NotEqual, v, NULL_SENTINEL);
                b.ins().uextend(I64, cmp)
            }

            If {
                cond,
                then_expr,
                else_expr,
            } => {
                let c = self.emit(b, cond)?;
                let t = self.emit(b, then_expr)?;
                let e = self.emit(b, else_expr)?;
                let is_true = b.ins().icmp_imm(IntCC::NotEqual, c, 0);
                b.ins().select(is_true, t, e)
            }

            Call { symbol, args, .. } => self.call(b, symbol, args)?,
        };
        Ok(value)
    }

    fn icmp(
        &mut self,
        b: &mut FunctionBuilder,
        cc: IntCC,
        left: &Expr,
        right: &Expr,
    ) -> Result<Value, CodegenError> {
        let l = self.emit(b, left)?;
        let r = self.emit(b, right)?;
        let cmp = b.ins().icmp(cc, l, r);
        Ok(b.ins().uextend(I64, cmp))
    }

    fn binary(
        &mut self,
        b: &mut FunctionBuilder,
        left: &Expr,
        right: &Expr,
        op: impl FnOnce(&mut FunctionBuilder, Value, Value) -> Value,
    ) -> Result<Value, CodegenError> {
        let l = self.emit(b, left)?;
        let r = self.emit(b, right)?;
        Ok(op(b, l, r))
    }

    fn select_op(
        &mut self,
        b: &mut FunctionBuilder,
        cc: IntCC,
        left: &Expr,
        right: &Expr,
    ) -> Result<Value, CodegenError> {
        let l = self.emit(b, left)?;
        let r = self.emit(b, right)?;
        let cmp = b.ins().icmp(cc, l, r);
        Ok(b.ins().select(cmp, l, r))
    }

    /// Signed division or remainder yielding NULL where the hardware would trap:
    /// a zero divisor, or `i64::MIN / -1`.
    fn checked_div(
        &mut self,
        b: &mut FunctionBuilder,
        left: &Expr,
        right: &Expr,
        remainder: bool,
    ) -> Result<Value, CodegenError> {
        let l = self.emit(b, left)?;
        let r = self.emit(b, right)?;

        let by_zero = b.ins().icmp_imm(IntCC::Equal, r, 0);
        let min = b.ins().icmp_imm(IntCC::Equal, l, i64::MIN);
        let minus_one = b.ins().icmp_imm(IntCC::Equal, r, -1);
        let overflow = b.ins().band(min, minus_one);
        let is_null = b.ins().bor(by_zero, overflow);

        let divide = b.create_block();
        let merge = b.create_block();
        b.append_block_param(merge, I64);

        let null = b.ins().iconst(I64, NULL_SENTINEL);
        b.ins().brif(is_null, merge, &[null], divide, &[]);

        b.switch_to_block(divide);
        b.seal_block(divide);
        let result = if remainder {
            b.ins().srem(l, r)
        } else {
            b.ins().sdiv(l, r)
        };
        b.ins().jump(merge, &[result]);

        b.switch_to_block(merge);
        b.seal_block(merge);
        Ok(b.block_params(merge)[0])
    }

    fn call(
        &mut self,
        b: &mut FunctionBuilder,
        symbol: &str,
        args: &[Expr],
    ) -> Result<Value, CodegenError> {
        let native = self
            .natives
            .get(symbol)
            .ok_or_else(|| CodegenError::Codegen(format!("unknown function {symbol}")))?;
        if native.arity != args.len() {
            return Err(CodegenError::Codegen(format!(
                "{symbol} takes {} arguments, called with {}",
                native.arity,
                args.len()
            )));
        }

        let values = args
            .iter()
            .map(|arg| self.emit(b, arg))
            .collect::<Result<Vec<_>, _>>()?;

        let size = (values.len().max(1) as u32) * SLOT as u32;
        let slot = b.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, size, 3));
        for (i, v) in values.iter().enumerate() {
            b.ins().stack_store(*v, slot, i as i32 * SLOT);
        }
        let argv = b.ins().stack_addr(self.ptr_type, slot, 0);
        let argc = b.ins().iconst(self.ptr_type, values.len() as i64);

        let callee = self.callee(b, symbol)?;
        let call = b.ins().call(callee, &[argv, argc]);
        Ok(b.inst_results(call)[0])
    }

    fn callee(&mut self, b: &mut FunctionBuilder, symbol: &str) -> Result<FuncRef, CodegenError> {
        if let Some(callee) = self.callees.get(symbol) {
            return Ok(*callee);
        }
        let sig = native_signature(self.module);
        let id = self.module.declare_function(symbol, Linkage::Import, &sig)?;
        let callee = self.module.declare_func_in_func(id, b.func);
        self.callees.insert(symbol.to_string(), callee);
        Ok(callee)
    }
}

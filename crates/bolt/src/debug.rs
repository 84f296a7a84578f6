//! Disassembler
//!
//! Pretty-prints a module or function: its constant pool followed by the
//! instruction stream with decoded operands. Backs the CLI's `--dump` flag
//! and compiler tests.

use crate::context::Context;
use crate::object::{FnObj, ModuleObj, ObjKind, obj_kind, to_string};
use crate::op::{Op, OpCode};
use crate::value::Value;

fn format_constant(ctx: &mut Context, value: Value) -> String {
    if value.is_object() {
        unsafe {
            let obj = value.as_object();
            match obj_kind(obj) {
                ObjKind::Fn | ObjKind::Method => return format!("<fn {:p}>", obj),
                ObjKind::NativeFn => return format!("<native fn {:p}>", obj),
                ObjKind::Type => {
                    let name = crate::types::type_name(obj as *mut crate::types::TypeObj);
                    return format!("<type {}>", name);
                }
                ObjKind::String => {
                    let s = obj as *mut crate::object::StringObj;
                    return format!("\"{}\"", (*s).as_str());
                }
                _ => {}
            }
        }
    }
    let s = to_string(ctx, value);
    unsafe { (*s).as_str().to_string() }
}

fn format_op(op: Op) -> String {
    let accel = if op.is_accelerated() { "*" } else { " " };
    match op.code() {
        OpCode::Load => format!("LOAD{}       r{} <- k{}", accel, op.a, op.ubc()),
        OpCode::LoadSmall => format!("LOAD_SMALL{} r{} <- {}", accel, op.a, op.ibc()),
        OpCode::LoadNull => format!("LOAD_NULL{}  r{}", accel, op.a),
        OpCode::LoadBool => format!("LOAD_BOOL{}  r{} <- {}", accel, op.a, op.b != 0),
        OpCode::LoadImport => format!("LOAD_IMP{}   r{} <- import[{}]", accel, op.a, op.b),
        OpCode::Table => {
            if op.is_accelerated() {
                format!("TABLE*      r{} (cap {}, proto r{})", op.a, op.b, op.c)
            } else {
                format!("TABLE       r{} (cap {})", op.a, op.ibc())
            }
        }
        OpCode::Array => format!("ARRAY{}      r{} (len {})", accel, op.a, op.ibc()),
        OpCode::Move => format!("MOVE{}       r{} <- r{}", accel, op.a, op.b),
        OpCode::Export => format!("EXPORT{}     key r{} val r{} type r{}", accel, op.a, op.b, op.c),
        OpCode::Close => format!("CLOSE{}      r{} <- fn r{} ({} upvals)", accel, op.a, op.b, op.c),
        OpCode::LoadUp => format!("LOADUP{}     r{} <- upv[{}]", accel, op.a, op.b),
        OpCode::StoreUp => format!("STOREUP{}    upv[{}] <- r{}", accel, op.a, op.b),
        OpCode::Neg => format!("NEG{}        r{} <- -r{}", accel, op.a, op.b),
        OpCode::Add => format!("ADD{}        r{} <- r{} + r{}", accel, op.a, op.b, op.c),
        OpCode::Sub => format!("SUB{}        r{} <- r{} - r{}", accel, op.a, op.b, op.c),
        OpCode::Mul => format!("MUL{}        r{} <- r{} * r{}", accel, op.a, op.b, op.c),
        OpCode::Div => format!("DIV{}        r{} <- r{} / r{}", accel, op.a, op.b, op.c),
        OpCode::Eq => format!("EQ{}         r{} <- r{} == r{}", accel, op.a, op.b, op.c),
        OpCode::Neq => format!("NEQ{}        r{} <- r{} != r{}", accel, op.a, op.b, op.c),
        OpCode::Lt => format!("LT{}         r{} <- r{} < r{}", accel, op.a, op.b, op.c),
        OpCode::Lte => format!("LTE{}        r{} <- r{} <= r{}", accel, op.a, op.b, op.c),
        OpCode::And => format!("AND{}        r{} <- r{} and r{}", accel, op.a, op.b, op.c),
        OpCode::Or => format!("OR{}         r{} <- r{} or r{}", accel, op.a, op.b, op.c),
        OpCode::Not => format!("NOT{}        r{} <- not r{}", accel, op.a, op.b),
        OpCode::LoadIdx => format!("LOAD_IDX{}   r{} <- r{}[r{}]", accel, op.a, op.b, op.c),
        OpCode::StoreIdx => format!("STORE_IDX{}  r{}[r{}] <- r{}", accel, op.a, op.b, op.c),
        OpCode::LoadIdxK => format!("LOAD_IDX_K{} r{} <- r{}[k{}]", accel, op.a, op.b, op.c),
        OpCode::StoreIdxK => format!("STORE_IDX_K{} r{}[k{}] <- r{}", accel, op.a, op.b, op.c),
        OpCode::Expect => format!("EXPECT{}     r{} <- r{}!", accel, op.a, op.b),
        OpCode::Exists => format!("EXISTS{}     r{} <- r{}?", accel, op.a, op.b),
        OpCode::Coalesce => format!("COALESCE{}   r{} <- r{} ?? r{}", accel, op.a, op.b, op.c),
        OpCode::TCheck => format!("TCHECK{}     r{} <- r{} is r{}", accel, op.a, op.b, op.c),
        OpCode::TSatis => format!("TSATIS{}     r{} <- r{} satisfies r{}", accel, op.a, op.b, op.c),
        OpCode::TCast => format!("TCAST{}      r{} <- r{} as r{}", accel, op.a, op.b, op.c),
        OpCode::TSet => format!("TSET{}       type r{}[r{}] <- r{}", accel, op.a, op.b, op.c),
        OpCode::Compose => format!("COMPOSE{}    r{} <- r{} & r{}", accel, op.a, op.b, op.c),
        OpCode::Call => format!("CALL{}       r{} <- r{}({} args)", accel, op.a, op.b, op.c),
        OpCode::Jmp => format!("JMP{}        {:+}", accel, op.ibc()),
        OpCode::JmpF => format!("JMPF{}       r{} {:+}", accel, op.a, op.ibc()),
        OpCode::Return => format!("RETURN{}     r{}", accel, op.a),
        OpCode::End => format!("END{}", accel),
        OpCode::NumFor => format!("NUMFOR{}     r{} {:+}", accel, op.a, op.ibc()),
        OpCode::IterFor => format!("ITERFOR{}    r{} {:+}", accel, op.a, op.ibc()),
        OpCode::LoadSubF => format!("LOAD_SUB_F{} r{} <- r{}[r{}]", accel, op.a, op.b, op.c),
        OpCode::StoreSubF => format!("STORE_SUB_F{} r{}[r{}] <- r{}", accel, op.a, op.b, op.c),
        OpCode::Halt => format!("HALT{}", accel),
    }
}

fn dump_stream(ctx: &mut Context, constants: &[Value], instructions: &[Op], out: &mut String) {
    if !constants.is_empty() {
        out.push_str("constants:\n");
        for (i, constant) in constants.iter().enumerate() {
            out.push_str(&format!("  k{:<3} {}\n", i, format_constant(ctx, *constant)));
        }
    }
    out.push_str("instructions:\n");
    for (i, op) in instructions.iter().enumerate() {
        out.push_str(&format!("  {:04} {}\n", i, format_op(*op)));
    }
}

/// Disassemble one function.
pub fn dump_fn(ctx: &mut Context, func: *mut FnObj) -> String {
    let mut out = String::new();
    unsafe {
        out.push_str(&format!("fn {:p} (stack {})\n", func, (*func).stack_size));
        let constants = (*func).constants.clone();
        let instructions = (*func).instructions.clone();
        dump_stream(ctx, &constants, &instructions, &mut out);
    }
    out
}

/// Disassemble a module and every function in its constant pool.
pub fn dump_module(ctx: &mut Context, module: *mut ModuleObj) -> String {
    let mut out = String::new();
    unsafe {
        let name = if (*module).name.is_null() {
            "<module>".to_string()
        } else {
            (*(*module).name).as_str().to_string()
        };
        out.push_str(&format!("module {} (stack {})\n", name, (*module).stack_size));

        let constants = (*module).constants.clone();
        let instructions = (*module).instructions.clone();
        dump_stream(ctx, &constants, &instructions, &mut out);

        for constant in &constants {
            if constant.is_object() {
                let obj = constant.as_object();
                if matches!(obj_kind(obj), ObjKind::Fn | ObjKind::Method) {
                    out.push('\n');
                    out.push_str(&dump_fn(ctx, obj as *mut FnObj));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_lists_instructions() {
        let mut ctx = Context::new();
        let module = ctx.compile_module("let x = 1\nreturn x + 1", "<test>").unwrap();
        let text = dump_module(&mut ctx, module);
        assert!(text.contains("LOAD_SMALL"));
        assert!(text.contains("RETURN"));
        assert!(text.contains("HALT"));
    }

    #[test]
    fn test_dump_includes_nested_fns() {
        let mut ctx = Context::new();
        let module = ctx
            .compile_module("fn f(): number { return 1 }", "<test>")
            .unwrap();
        let text = dump_module(&mut ctx, module);
        assert!(text.contains("fn 0x"));
    }
}

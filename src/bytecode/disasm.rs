//! Human-readable chunk dump, used by the `-d` CLI flag and by tests that
//! assert on compiled shape (SPEC_FULL.md §8). Grounded in raya-engine's
//! re-exported `disassemble_function` helper.

use crate::bytecode::chunk::Chunk;
use crate::bytecode::opcode::Opcode;
use std::fmt::Write as _;

pub fn disassemble(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset, &mut out);
    }
    out
}

fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{offset:04} {:4} ", chunk.lines.line_for(offset as u32));
    let byte = chunk.read_u8(offset);
    let Some(op) = Opcode::from_u8(byte) else {
        let _ = writeln!(out, "unknown opcode {byte:#04x}");
        return offset + 1;
    };
    use Opcode::*;
    match op {
        Nop | Pop | Dup | ConstNil | ConstTrue | ConstFalse | Add | Sub | Mul | Div | Mod
        | Neg | AddII | SubII | MulII | DivII | ModII | NegI | Eq | Ne | Lt | Gt | Le | Ge
        | Not | TypeOf | Return | CloseUpvalue | Throw | IndexGet | IndexSet | IndexFastGet | Inherit => {
            let _ = writeln!(out, "{op:?}");
            offset + 1
        }
        ConstInt => {
            let v = chunk.read_i32(offset + 1);
            let _ = writeln!(out, "{op:?} {v}");
            offset + 5
        }
        Const | NewArray | NewDict => {
            let idx = chunk.read_u16(offset + 1);
            let extra = chunk.constants.get(idx as usize).map(|v| format!(" ; {v}")).unwrap_or_default();
            let _ = writeln!(out, "{op:?} {idx}{extra}");
            offset + 3
        }
        LoadGlobal | StoreGlobal | Class | Method => {
            let sym = chunk.read_u32(offset + 1);
            let _ = writeln!(out, "{op:?} sym#{sym}");
            offset + 5
        }
        LoadLocal | StoreLocal => {
            let slot = chunk.read_u16(offset + 1);
            let _ = writeln!(out, "{op:?} {slot}");
            offset + 3
        }
        LoadUpvalue | StoreUpvalue => {
            let slot = chunk.read_u8(offset + 1);
            let _ = writeln!(out, "{op:?} {slot}");
            offset + 2
        }
        Jmp | JmpIfFalse | JmpIfTrue | JmpIfLt | JmpIfLe | JmpIfGt | JmpIfGe | JmpIfEq | JmpIfNe => {
            let delta = chunk.read_i32(offset + 1);
            let _ = writeln!(out, "{op:?} -> {}", offset as i64 + 5 + delta as i64);
            offset + 5
        }
        Loop => {
            let delta = chunk.read_u32(offset + 1);
            let _ = writeln!(out, "{op:?} -> {}", offset as i64 + 5 - delta as i64);
            offset + 5
        }
        Call | TailCall => {
            let argc = chunk.read_u8(offset + 1);
            let _ = writeln!(out, "{op:?} ({argc} args)");
            offset + 2
        }
        Closure => {
            let idx = chunk.read_u16(offset + 1);
            let _ = writeln!(out, "{op:?} {idx}");
            offset + 3
        }
        GetField | SetField | GetSuper => {
            let ic = chunk.read_u16(offset + 1);
            let sym = chunk.read_u32(offset + 3);
            let _ = writeln!(out, "{op:?} ic={ic} sym#{sym}");
            offset + 7
        }
        Invoke => {
            let ic = chunk.read_u16(offset + 1);
            let sym = chunk.read_u32(offset + 3);
            let argc = chunk.read_u8(offset + 7);
            let _ = writeln!(out, "{op:?} ic={ic} sym#{sym} ({argc} args)");
            offset + 8
        }
        CallNative => {
            let id = chunk.read_u16(offset + 1);
            let argc = chunk.read_u8(offset + 3);
            let _ = writeln!(out, "{op:?} #{id} ({argc} args)");
            offset + 4
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn disassembles_a_simple_chunk() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::int(41));
        chunk.write_u8(Opcode::Const as u8, 1);
        chunk.write_u16(idx, 1);
        chunk.write_u8(Opcode::Return as u8, 1);
        let out = disassemble(&chunk, "test");
        assert!(out.contains("Const"));
        assert!(out.contains("Return"));
    }
}

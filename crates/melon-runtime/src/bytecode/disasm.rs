//! Bytecode disassembler
//!
//! Converts compiled functions back to a human-readable listing, recursing
//! into nested functions and class initializers found in constant pools.
//! Used for debugging, testing, and `melon disasm` output.

use super::{Chunk, Opcode, OperandKind};
use crate::value::{Function, Value};
use std::fmt::Write;

/// Disassemble a function, its constants, and every nested function
pub fn disassemble_function(function: &Function) -> String {
    let mut output = String::new();
    disassemble_into(function, 0, &mut output);
    output
}

fn indent(depth: usize, output: &mut String) {
    for _ in 0..depth {
        output.push_str("    ");
    }
}

fn disassemble_into(function: &Function, depth: usize, output: &mut String) {
    let Some(chunk) = function.chunk() else {
        indent(depth, output);
        writeln!(output, "<native fn {}>", function.name).unwrap();
        return;
    };

    indent(depth, output);
    writeln!(output, "=== fn {} ({} bytes) ===", function.name, chunk.code.len()).unwrap();

    let mut offset = 0;
    while offset < chunk.code.len() {
        let line = disassemble_instruction(chunk, &mut offset);
        indent(depth, output);
        writeln!(output, "{}", line).unwrap();
    }

    if !chunk.constants.is_empty() {
        indent(depth, output);
        writeln!(output, "--- constants of {} ---", function.name).unwrap();
        for (idx, constant) in chunk.constants.iter().enumerate() {
            indent(depth, output);
            writeln!(output, "{}: {}", idx, format_constant(constant)).unwrap();
            match constant {
                Value::Closure(closure) => {
                    disassemble_into(&closure.function, depth + 1, output);
                }
                Value::Class(class) => {
                    disassemble_class(class, depth + 1, output);
                }
                _ => {}
            }
        }
    }
}

fn disassemble_class(class: &crate::value::Class, depth: usize, output: &mut String) {
    indent(depth, output);
    writeln!(output, "=== class {} (nvars: {}) ===", class.name, class.nvars).unwrap();
    if let Some(init) = class.lookup_closure("$init") {
        disassemble_into(&init.function, depth + 1, output);
    }
    if let Some(meta) = &class.metaclass {
        if let Some(init) = meta.lookup_closure("$init") {
            indent(depth + 1, output);
            writeln!(output, "--- metaclass {} ---", meta.name).unwrap();
            disassemble_into(&init.function, depth + 1, output);
        }
    }
}

/// Disassemble a single instruction at the given offset
///
/// Advances `offset` past the instruction and its operands.
fn disassemble_instruction(chunk: &Chunk, offset: &mut usize) -> String {
    let start = *offset;
    let byte = chunk.code[*offset];
    *offset += 1;

    let opcode = match Opcode::try_from(byte) {
        Ok(op) => op,
        Err(_) => return format!("{:04}  <invalid opcode: {:#04x}>", start, byte),
    };

    match opcode.operand_kind() {
        OperandKind::None => format!("{:04}  {}", start, opcode.mnemonic()),
        OperandKind::Byte => {
            let operand = read_byte(chunk, offset);
            format!("{:04}  {} {}", start, opcode.mnemonic(), operand)
        }
        OperandKind::Wide => {
            let hi = read_byte(chunk, offset) as u16;
            let lo = read_byte(chunk, offset) as u16;
            format!("{:04}  {} {}", start, opcode.mnemonic(), (hi << 8) | lo)
        }
        OperandKind::Pair => {
            let a = read_byte(chunk, offset);
            let b = read_byte(chunk, offset);
            format!("{:04}  {} {}, {}", start, opcode.mnemonic(), a, b)
        }
    }
}

fn read_byte(chunk: &Chunk, offset: &mut usize) -> u8 {
    let byte = chunk.code.get(*offset).copied().unwrap_or(0);
    *offset += 1;
    byte
}

fn format_constant(value: &Value) -> String {
    match value {
        Value::Str(s) => format!("\"{}\"", s),
        other => other.to_display_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Function;

    #[test]
    fn test_disassemble_simple_chunk() {
        let mut chunk = Chunk::new();
        chunk.emit_with(Opcode::LoadInt, 1);
        chunk.emit_with(Opcode::LoadInt, 2);
        chunk.emit(Opcode::Add);
        chunk.emit(Opcode::Halt);
        let function = Function::melon("<main>", chunk, 0);

        let listing = disassemble_function(&function);
        assert!(listing.contains("=== fn <main>"));
        assert!(listing.contains("0000  LoadInt 1"));
        assert!(listing.contains("0004  Add"));
        assert!(listing.contains("Halt"));
    }

    #[test]
    fn test_disassemble_wide_operand() {
        let mut chunk = Chunk::new();
        let at = chunk.emit_jump(Opcode::JumpIfFalse);
        chunk.emit(Opcode::Nop);
        chunk.patch_jump(at);
        let function = Function::melon("f", chunk, 0);

        // operand at offset 1, target 4 → offset 3
        let listing = disassemble_function(&function);
        assert!(listing.contains("JumpIfFalse 3"));
    }

    #[test]
    fn test_disassemble_string_constant() {
        let mut chunk = Chunk::new();
        let k = chunk.add_constant(Value::string("iterate")).unwrap();
        chunk.emit_with(Opcode::LoadConst, k);
        let function = Function::melon("f", chunk, 0);

        let listing = disassemble_function(&function);
        assert!(listing.contains("\"iterate\""));
    }
}

//! Bytecode disassembler for debugging.

use std::fmt::Write;

use crate::bytecode::chunk::{Chunk, Constant, Function};
use crate::bytecode::instruction::OpCode;

/// Disassemble a compiled function into human-readable output.
pub fn disassemble_function(function: &Function) -> String {
    let mut output = String::new();

    writeln!(&mut output, "== {} ==", function.signature()).unwrap();

    disassemble_chunk(&function.chunk, &mut output);

    // Disassemble nested functions
    for constant in &function.chunk.constants {
        if let Constant::Function(nested) = constant {
            writeln!(&mut output).unwrap();
            output.push_str(&disassemble_function(nested));
        }
    }

    output
}

/// Disassemble a chunk into human-readable output.
pub fn disassemble_chunk(chunk: &Chunk, output: &mut String) {
    let mut offset = 0;

    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, output);
    }
}

/// Disassemble a single instruction.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, output: &mut String) -> usize {
    write!(output, "{:04} ", offset).unwrap();

    // Line number, or | when unchanged from the previous instruction
    let line = chunk.get_line(offset);
    if offset > 0 && line == chunk.get_line(offset - 1) {
        write!(output, "   | ").unwrap();
    } else {
        write!(output, "{:4} ", line).unwrap();
    }

    let byte = chunk.code[offset];
    let opcode = match OpCode::from_u8(byte) {
        Some(op) => op,
        None => {
            writeln!(output, "Unknown opcode {}", byte).unwrap();
            return offset + 1;
        }
    };

    match opcode {
        // Simple instructions (no operands)
        OpCode::Null
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Dup
        | OpCode::Dup2
        | OpCode::CloseUpvalue
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Modulo
        | OpCode::Negate
        | OpCode::Equal
        | OpCode::NotEqual
        | OpCode::Less
        | OpCode::LessEqual
        | OpCode::Greater
        | OpCode::GreaterEqual
        | OpCode::Not
        | OpCode::Return
        | OpCode::Inherit
        | OpCode::Index
        | OpCode::IndexSet
        | OpCode::GetIterator
        | OpCode::PatternFail
        | OpCode::Assert => {
            writeln!(output, "{:?}", opcode).unwrap();
            offset + 1
        }

        // One byte operand
        OpCode::Call | OpCode::GetUpvalue | OpCode::SetUpvalue => {
            let operand = chunk.code[offset + 1];
            writeln!(output, "{:?} {}", opcode, operand).unwrap();
            offset + 2
        }

        OpCode::Constant => {
            let idx = chunk.read_u16(offset + 1);
            let constant = &chunk.constants[idx as usize];
            writeln!(output, "{:?} {} ({})", opcode, idx, constant_str(constant)).unwrap();
            offset + 3
        }

        // Named operands
        OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::DefineGlobal
        | OpCode::Class
        | OpCode::Method
        | OpCode::StaticMethod
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper => {
            let idx = chunk.read_u16(offset + 1);
            let name = match chunk.constants.get(idx as usize) {
                Some(constant @ Constant::String(_)) => constant_str(constant),
                _ => format!("?{}", idx),
            };
            writeln!(output, "{:?} {} ({})", opcode, idx, name).unwrap();
            offset + 3
        }

        OpCode::GetLocal | OpCode::SetLocal | OpCode::BuildList | OpCode::BuildMap => {
            let operand = chunk.read_u16(offset + 1);
            writeln!(output, "{:?} {}", opcode, operand).unwrap();
            offset + 3
        }

        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue | OpCode::IterNext => {
            let jump = chunk.read_u16(offset + 1) as usize;
            let target = offset + 3 + jump;
            writeln!(output, "{:?} {} -> {}", opcode, jump, target).unwrap();
            offset + 3
        }

        OpCode::Loop => {
            let jump = chunk.read_u16(offset + 1) as usize;
            let target = offset + 3 - jump;
            writeln!(output, "{:?} {} -> {}", opcode, jump, target).unwrap();
            offset + 3
        }

        OpCode::MatchGlobal => {
            let idx = chunk.read_u16(offset + 1);
            writeln!(output, "{:?} {} ({})", opcode, idx, pattern_str(chunk, idx)).unwrap();
            offset + 3
        }

        OpCode::MatchLocal => {
            let idx = chunk.read_u16(offset + 1);
            let base_slot = chunk.read_u16(offset + 3);
            writeln!(
                output,
                "{:?} {} ({}) base={}",
                opcode,
                idx,
                pattern_str(chunk, idx),
                base_slot
            )
            .unwrap();
            offset + 5
        }

        // Closure (variable operands for upvalues)
        OpCode::Closure => {
            let func_idx = chunk.read_u16(offset + 1);
            let function = match chunk.constants.get(func_idx as usize) {
                Some(Constant::Function(f)) => f,
                _ => {
                    writeln!(output, "{:?} {} (invalid)", opcode, func_idx).unwrap();
                    return offset + 3;
                }
            };

            writeln!(output, "{:?} {} ({})", opcode, func_idx, function.name).unwrap();

            let mut new_offset = offset + 3;
            for _ in 0..function.upvalue_count {
                let is_local = chunk.code[new_offset] != 0;
                let index = chunk.code[new_offset + 1];
                writeln!(
                    output,
                    "{:04}      |                   {} {}",
                    new_offset,
                    if is_local { "local" } else { "upvalue" },
                    index
                )
                .unwrap();
                new_offset += 2;
            }
            new_offset
        }
    }
}

/// Convert a constant to a display string.
fn constant_str(constant: &Constant) -> String {
    match constant {
        Constant::Number(n) => format!("{}", n),
        Constant::String(s) => {
            if s.chars().count() > 20 {
                let head: String = s.chars().take(20).collect();
                format!("\"{}...\"", head)
            } else {
                format!("\"{}\"", s)
            }
        }
        Constant::Keyword(k) => format!("#{}", k),
        Constant::Bool(b) => format!("{}", b),
        Constant::Null => "null".to_string(),
        Constant::Function(f) => format!("<fn {}>", f.name),
        Constant::Pattern(p) => format!("<pattern, {} binding(s)>", p.bindings.len()),
    }
}

fn pattern_str(chunk: &Chunk, idx: u16) -> String {
    match chunk.constants.get(idx as usize) {
        Some(constant @ Constant::Pattern(_)) => constant_str(constant),
        _ => format!("?{}", idx),
    }
}

/// Print disassembly to stdout.
pub fn print_disassembly(function: &Function) {
    print!("{}", disassemble_function(function));
}

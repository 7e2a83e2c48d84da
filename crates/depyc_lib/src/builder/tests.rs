use std::collections::HashMap;
use std::rc::Rc;

use super::build_from_code;
use crate::object::{Code, Module, Value};
use crate::opcodes::{Opcode, OpcodeTable};
use crate::{decompile, printer, Version};

/// Two-pass assembler so tests can write jumps against labels instead of
/// hand-counted offsets. Operands are encoded through the same opcode
/// table the cursor decodes with.
struct Asm {
    table: OpcodeTable,
    buf: Vec<u8>,
    labels: HashMap<&'static str, u32>,
    fixups: Vec<Fixup>,
}

struct Fixup {
    arg_at: usize,
    label: &'static str,
    relative: bool,
}

impl Asm {
    fn new(version: Version) -> Asm {
        Asm {
            table: OpcodeTable::new(version),
            buf: Vec::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
        }
    }

    fn byte_of(&self, op: Opcode) -> u8 {
        self.table
            .encode(op)
            .unwrap_or_else(|| panic!("{op:?} not in this version's table"))
    }

    fn op(&mut self, op: Opcode) -> &mut Self {
        let byte = self.byte_of(op);
        assert!(byte < crate::opcodes::HAVE_ARGUMENT, "{op:?} takes an operand");
        self.buf.push(byte);
        self
    }

    fn op_a(&mut self, op: Opcode, arg: u16) -> &mut Self {
        let byte = self.byte_of(op);
        assert!(byte >= crate::opcodes::HAVE_ARGUMENT, "{op:?} takes no operand");
        self.buf.push(byte);
        self.buf.extend_from_slice(&arg.to_le_bytes());
        self
    }

    fn jump(&mut self, op: Opcode, label: &'static str, relative: bool) -> &mut Self {
        let byte = self.byte_of(op);
        self.buf.push(byte);
        self.fixups.push(Fixup {
            arg_at: self.buf.len(),
            label,
            relative,
        });
        self.buf.extend_from_slice(&[0, 0]);
        self
    }

    fn jump_abs(&mut self, op: Opcode, label: &'static str) -> &mut Self {
        self.jump(op, label, false)
    }

    fn jump_rel(&mut self, op: Opcode, label: &'static str) -> &mut Self {
        self.jump(op, label, true)
    }

    fn label(&mut self, name: &'static str) -> &mut Self {
        self.labels.insert(name, self.buf.len() as u32);
        self
    }

    fn finish(mut self) -> Vec<u8> {
        for fixup in &self.fixups {
            let target = *self
                .labels
                .get(fixup.label)
                .unwrap_or_else(|| panic!("undefined label {}", fixup.label));
            let value = if fixup.relative {
                let next = (fixup.arg_at + 2) as u32;
                target
                    .checked_sub(next)
                    .unwrap_or_else(|| panic!("backward relative jump to {}", fixup.label))
            } else {
                target
            };
            let bytes = (value as u16).to_le_bytes();
            self.buf[fixup.arg_at] = bytes[0];
            self.buf[fixup.arg_at + 1] = bytes[1];
        }
        self.buf
    }
}

const PY27: Version = Version { major: 2, minor: 7 };

fn make_code(
    consts: Vec<Value>,
    names: &[&str],
    varnames: &[&str],
    bytecode: Vec<u8>,
) -> Rc<Code> {
    Rc::new(Code {
        arg_count: 0,
        kwonly_arg_count: 0,
        num_locals: varnames.len() as u32,
        stack_size: 10,
        flags: 0,
        code: bytecode,
        consts,
        names: names.iter().map(|s| s.to_string()).collect(),
        varnames: varnames.iter().map(|s| s.to_string()).collect(),
        free_vars: Vec::new(),
        cell_vars: Vec::new(),
        filename: "test.py".to_string(),
        name: "<module>".to_string(),
    })
}

fn render(code: Rc<Code>, version: Version) -> String {
    let module = Module { version, code };
    let mut out = String::new();
    printer::render_source(&mut out, &module).expect("rendering failed");
    out
}

#[test]
fn arithmetic_keeps_native_precedence() {
    let mut asm = Asm::new(PY27);
    asm.op_a(Opcode::LoadConst, 0)
        .op_a(Opcode::LoadConst, 1)
        .op_a(Opcode::LoadConst, 2)
        .op(Opcode::BinaryMultiply)
        .op(Opcode::BinaryAdd)
        .op_a(Opcode::StoreName, 0)
        .op_a(Opcode::LoadConst, 3)
        .op(Opcode::ReturnValue);
    let code = make_code(
        vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::None],
        &["a"],
        &[],
        asm.finish(),
    );
    assert_eq!(render(code, PY27), "a = 1 + 2 * 3\n");
}

#[test]
fn short_circuit_conditions_coalesce() {
    let mut asm = Asm::new(PY27);
    asm.op_a(Opcode::LoadName, 0)
        .op_a(Opcode::LoadConst, 0)
        .op_a(Opcode::CompareOp, 4)
        .jump_abs(Opcode::PopJumpIfFalse, "end")
        .op_a(Opcode::LoadName, 0)
        .op_a(Opcode::LoadConst, 1)
        .op_a(Opcode::CompareOp, 0)
        .jump_abs(Opcode::PopJumpIfFalse, "end")
        .op_a(Opcode::LoadConst, 2)
        .op_a(Opcode::StoreName, 1)
        .label("end")
        .op_a(Opcode::LoadConst, 3)
        .op(Opcode::ReturnValue);
    let code = make_code(
        vec![Value::Int(0), Value::Int(10), Value::Int(1), Value::None],
        &["x", "y"],
        &[],
        asm.finish(),
    );
    assert_eq!(render(code, PY27), "if x > 0 and x < 10:\n    y = 1\n");
}

#[test]
fn try_except_finally_renders_in_order() {
    let mut asm = Asm::new(PY27);
    asm.jump_rel(Opcode::SetupFinally, "fin")
        .jump_rel(Opcode::SetupExcept, "handler")
        .op_a(Opcode::LoadName, 0)
        .op_a(Opcode::CallFunction, 0)
        .op(Opcode::PopTop)
        .op(Opcode::PopBlock)
        .jump_rel(Opcode::JumpForward, "after_except")
        .label("handler")
        .op(Opcode::DupTop)
        .op_a(Opcode::LoadName, 1)
        .op_a(Opcode::CompareOp, 10)
        .jump_abs(Opcode::PopJumpIfFalse, "reraise")
        .op(Opcode::PopTop)
        .op_a(Opcode::StoreName, 2)
        .op(Opcode::PopTop)
        .op_a(Opcode::LoadName, 3)
        .op_a(Opcode::LoadName, 2)
        .op_a(Opcode::CallFunction, 1)
        .op(Opcode::PopTop)
        .jump_rel(Opcode::JumpForward, "after_except")
        .label("reraise")
        .op(Opcode::EndFinally)
        .label("after_except")
        .op(Opcode::PopBlock)
        .op_a(Opcode::LoadConst, 0)
        .label("fin")
        .op_a(Opcode::LoadName, 4)
        .op_a(Opcode::CallFunction, 0)
        .op(Opcode::PopTop)
        .op(Opcode::EndFinally)
        .op_a(Opcode::LoadConst, 0)
        .op(Opcode::ReturnValue);
    let code = make_code(
        vec![Value::None],
        &["f", "ValueError", "e", "g", "h"],
        &[],
        asm.finish(),
    );
    let out = render(code, PY27);

    let try_at = out.find("try:").expect("try keyword missing");
    let except_at = out.find("except ValueError").expect("except clause missing");
    let finally_at = out.find("finally:").expect("finally keyword missing");
    assert!(try_at < except_at && except_at < finally_at, "bad order:\n{out}");
    assert!(out.contains("f()"), "try body missing:\n{out}");
    assert!(out.contains("g(e)"), "handler body missing:\n{out}");
    assert_eq!(out.matches("h()").count(), 1, "finally body duplicated:\n{out}");
}

#[test]
fn list_comprehension_folds_generator() {
    let mut asm = Asm::new(PY27);
    asm.op_a(Opcode::BuildList, 0)
        .op_a(Opcode::LoadName, 0)
        .op_a(Opcode::LoadConst, 0)
        .op_a(Opcode::CallFunction, 1)
        .op(Opcode::GetIter)
        .label("loop")
        .jump_rel(Opcode::ForIter, "out")
        .op_a(Opcode::StoreName, 1)
        .op_a(Opcode::LoadName, 1)
        .op_a(Opcode::LoadName, 1)
        .op(Opcode::BinaryMultiply)
        .op_a(Opcode::ListAppend, 2)
        .jump_abs(Opcode::JumpAbsolute, "loop")
        .label("out")
        .op_a(Opcode::StoreName, 2)
        .op_a(Opcode::LoadConst, 1)
        .op(Opcode::ReturnValue);
    let code = make_code(
        vec![Value::Int(5), Value::None],
        &["range", "x", "r"],
        &[],
        asm.finish(),
    );
    assert_eq!(render(code, PY27), "r = [ x * x for x in range(5) ]\n");
}

#[test]
fn function_definition_with_defaults_and_varargs() {
    let mut body = Asm::new(PY27);
    body.op_a(Opcode::LoadFast, 0)
        .op_a(Opcode::LoadFast, 1)
        .op(Opcode::BinaryAdd)
        .op(Opcode::ReturnValue);
    let inner = Code {
        arg_count: 2,
        flags: Code::CO_VARARGS | Code::CO_VARKEYWORDS,
        code: body.finish(),
        consts: vec![Value::None],
        varnames: vec!["a".into(), "b".into(), "c".into(), "d".into()],
        stack_size: 4,
        name: "f".to_string(),
        filename: "test.py".to_string(),
        ..Code::default()
    };

    let mut asm = Asm::new(PY27);
    asm.op_a(Opcode::LoadConst, 0)
        .op_a(Opcode::LoadConst, 1)
        .op_a(Opcode::MakeFunction, 1)
        .op_a(Opcode::StoreName, 0)
        .op_a(Opcode::LoadConst, 2)
        .op(Opcode::ReturnValue);
    let code = make_code(
        vec![Value::Int(2), Value::Code(Rc::new(inner)), Value::None],
        &["f"],
        &[],
        asm.finish(),
    );
    let out = render(code, PY27);
    assert!(out.contains("def f(a, b = 2, *c, **d):\n"), "bad signature:\n{out}");
    assert!(out.contains("    return a + b"), "bad body:\n{out}");
}

#[test]
fn unsupported_opcode_degrades_with_warning() {
    let mut asm = Asm::new(PY27);
    asm.op_a(Opcode::LoadConst, 0)
        .op_a(Opcode::StoreName, 0)
        .op(Opcode::StoreMap)
        .op_a(Opcode::LoadConst, 1)
        .op(Opcode::ReturnValue);
    let code = make_code(
        vec![Value::Int(1), Value::None],
        &["a"],
        &[],
        asm.finish(),
    );
    assert_eq!(
        render(code, PY27),
        "a = 1\n# WARNING: Decompyle incomplete\n"
    );
}

#[test]
fn empty_body_renders_pass() {
    let mut asm = Asm::new(PY27);
    asm.op_a(Opcode::LoadConst, 0).op(Opcode::ReturnValue);
    let code = make_code(vec![Value::None], &[], &[], asm.finish());
    assert_eq!(render(code, PY27), "pass\n");
}

#[test]
fn single_element_tuple_keeps_trailing_comma() {
    let mut asm = Asm::new(PY27);
    asm.op_a(Opcode::LoadConst, 0)
        .op_a(Opcode::BuildTuple, 1)
        .op_a(Opcode::StoreName, 0)
        .op_a(Opcode::LoadConst, 1)
        .op(Opcode::ReturnValue);
    let code = make_code(
        vec![Value::Int(5), Value::None],
        &["t"],
        &[],
        asm.finish(),
    );
    assert_eq!(render(code, PY27), "t = (5,)\n");
}

#[test]
fn import_star_renders_as_from_import() {
    let mut asm = Asm::new(PY27);
    asm.op_a(Opcode::LoadConst, 0)
        .op_a(Opcode::LoadConst, 1)
        .op_a(Opcode::ImportName, 0)
        .op(Opcode::ImportStar)
        .op_a(Opcode::LoadConst, 2)
        .op(Opcode::ReturnValue);
    let code = make_code(
        vec![
            Value::Int(-1),
            Value::Tuple(vec![Value::Str("*".to_string())]),
            Value::None,
        ],
        &["m"],
        &[],
        asm.finish(),
    );
    assert_eq!(render(code, PY27), "from m import *\n");
}

#[test]
fn while_loop_with_condition() {
    let mut asm = Asm::new(PY27);
    asm.jump_rel(Opcode::SetupLoop, "end")
        .label("cond")
        .op_a(Opcode::LoadName, 0)
        .op_a(Opcode::LoadConst, 0)
        .op_a(Opcode::CompareOp, 0)
        .jump_abs(Opcode::PopJumpIfFalse, "popblock")
        .op_a(Opcode::LoadName, 0)
        .op_a(Opcode::LoadConst, 1)
        .op(Opcode::BinaryAdd)
        .op_a(Opcode::StoreName, 0)
        .jump_abs(Opcode::JumpAbsolute, "cond")
        .label("popblock")
        .op(Opcode::PopBlock)
        .label("end")
        .op_a(Opcode::LoadConst, 2)
        .op(Opcode::ReturnValue);
    let code = make_code(
        vec![Value::Int(3), Value::Int(1), Value::None],
        &["x"],
        &[],
        asm.finish(),
    );
    assert_eq!(render(code, PY27), "while x < 3:\n    x = x + 1\n");
}

#[test]
fn for_loop_chains_print_items() {
    let mut asm = Asm::new(PY27);
    asm.jump_rel(Opcode::SetupLoop, "end")
        .op_a(Opcode::LoadConst, 0)
        .op(Opcode::GetIter)
        .label("loop")
        .jump_rel(Opcode::ForIter, "popblock")
        .op_a(Opcode::StoreName, 0)
        .op_a(Opcode::LoadName, 0)
        .op(Opcode::PrintItem)
        .op(Opcode::PrintNewline)
        .jump_abs(Opcode::JumpAbsolute, "loop")
        .label("popblock")
        .op(Opcode::PopBlock)
        .label("end")
        .op_a(Opcode::LoadConst, 1)
        .op(Opcode::ReturnValue);
    let code = make_code(
        vec![
            Value::Tuple(vec![Value::Int(1), Value::Int(2)]),
            Value::None,
        ],
        &["i"],
        &[],
        asm.finish(),
    );
    assert_eq!(render(code, PY27), "for i in (1, 2):\n    print i\n");
}

#[test]
fn if_elif_else_chain() {
    let mut asm = Asm::new(PY27);
    asm.op_a(Opcode::LoadName, 0)
        .jump_abs(Opcode::PopJumpIfFalse, "l1")
        .op_a(Opcode::LoadConst, 0)
        .op_a(Opcode::StoreName, 2)
        .jump_rel(Opcode::JumpForward, "end")
        .label("l1")
        .op_a(Opcode::LoadName, 1)
        .jump_abs(Opcode::PopJumpIfFalse, "l2")
        .op_a(Opcode::LoadConst, 1)
        .op_a(Opcode::StoreName, 2)
        .jump_rel(Opcode::JumpForward, "end")
        .label("l2")
        .op_a(Opcode::LoadConst, 2)
        .op_a(Opcode::StoreName, 2)
        .label("end")
        .op_a(Opcode::LoadConst, 3)
        .op(Opcode::ReturnValue);
    let code = make_code(
        vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::None],
        &["a", "b", "x"],
        &[],
        asm.finish(),
    );
    assert_eq!(
        render(code, PY27),
        "if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n"
    );
}

#[test]
fn rendering_is_idempotent() {
    let mut asm = Asm::new(PY27);
    asm.op_a(Opcode::LoadName, 0)
        .op_a(Opcode::LoadConst, 0)
        .op_a(Opcode::CompareOp, 4)
        .jump_abs(Opcode::PopJumpIfFalse, "end")
        .op_a(Opcode::LoadConst, 1)
        .op_a(Opcode::StoreName, 1)
        .label("end")
        .op_a(Opcode::LoadConst, 2)
        .op(Opcode::ReturnValue);
    let code = make_code(
        vec![Value::Int(0), Value::Int(1), Value::None],
        &["x", "y"],
        &[],
        asm.finish(),
    );
    let first = render(code.clone(), PY27);
    let second = render(code, PY27);
    assert_eq!(first, second);
}

#[test]
fn open_block_residue_still_yields_output() {
    // SETUP_LOOP with no matching POP_BLOCK: warn and fold, never panic.
    let mut asm = Asm::new(PY27);
    asm.jump_rel(Opcode::SetupLoop, "end")
        .op_a(Opcode::LoadConst, 0)
        .op(Opcode::ReturnValue)
        .label("end");
    let code = make_code(vec![Value::None], &[], &[], asm.finish());
    let out = render(code, PY27);
    assert!(out.contains("while"), "folded loop block missing:\n{out}");
}

#[test]
fn globals_are_declared_at_function_entry() {
    let mut body = Asm::new(PY27);
    body.op_a(Opcode::LoadConst, 0)
        .op_a(Opcode::StoreGlobal, 0)
        .op_a(Opcode::LoadConst, 1)
        .op(Opcode::ReturnValue);
    let inner = Code {
        code: body.finish(),
        consts: vec![Value::Int(1), Value::None],
        names: vec!["counter".into()],
        stack_size: 2,
        name: "bump".to_string(),
        filename: "test.py".to_string(),
        ..Code::default()
    };

    let mut asm = Asm::new(PY27);
    asm.op_a(Opcode::LoadConst, 0)
        .op_a(Opcode::MakeFunction, 0)
        .op_a(Opcode::StoreName, 0)
        .op_a(Opcode::LoadConst, 1)
        .op(Opcode::ReturnValue);
    let code = make_code(
        vec![Value::Code(Rc::new(inner)), Value::None],
        &["bump"],
        &[],
        asm.finish(),
    );
    let out = render(code, PY27);
    assert!(out.contains("def bump():\n"), "bad def line:\n{out}");
    assert!(
        out.contains("    global counter\n"),
        "missing global declaration:\n{out}"
    );
    assert!(out.contains("    counter = 1"), "missing store:\n{out}");
}

#[test]
fn outcome_reports_collected_globals_and_clean_flag() {
    let mut asm = Asm::new(PY27);
    asm.op_a(Opcode::LoadConst, 0)
        .op_a(Opcode::StoreGlobal, 0)
        .op_a(Opcode::LoadConst, 0)
        .op_a(Opcode::StoreGlobal, 0)
        .op_a(Opcode::LoadConst, 1)
        .op(Opcode::ReturnValue);
    let code = make_code(
        vec![Value::Int(1), Value::None],
        &["g"],
        &[],
        asm.finish(),
    );
    let outcome = build_from_code(&code, PY27).unwrap();
    assert!(outcome.clean);
    // Duplicate stores collapse to one ordered entry.
    assert_eq!(outcome.globals, vec!["g".to_string()]);
}

#[test]
fn decompile_reads_a_full_pyc_image() {
    // A 2.7 image: magic, mtime, then the marshalled module code object.
    let mut image: Vec<u8> = Vec::new();
    image.extend_from_slice(&62211u16.to_le_bytes());
    image.extend_from_slice(b"\r\n");
    image.extend_from_slice(&0u32.to_le_bytes());

    let mut asm = Asm::new(PY27);
    asm.op_a(Opcode::LoadConst, 0).op(Opcode::ReturnValue);
    let bytecode = asm.finish();

    image.push(b'c');
    image.extend_from_slice(&0u32.to_le_bytes()); // argcount
    image.extend_from_slice(&0u32.to_le_bytes()); // nlocals
    image.extend_from_slice(&2u32.to_le_bytes()); // stacksize
    image.extend_from_slice(&0u32.to_le_bytes()); // flags
    image.push(b's'); // code string
    image.extend_from_slice(&(bytecode.len() as u32).to_le_bytes());
    image.extend_from_slice(&bytecode);
    image.push(b'('); // consts
    image.extend_from_slice(&1u32.to_le_bytes());
    image.push(b'N');
    for _ in 0..4 {
        // names, varnames, freevars, cellvars
        image.push(b'(');
        image.extend_from_slice(&0u32.to_le_bytes());
    }
    image.push(b's'); // filename
    image.extend_from_slice(&4u32.to_le_bytes());
    image.extend_from_slice(b"m.py");
    image.push(b's'); // name
    image.extend_from_slice(&8u32.to_le_bytes());
    image.extend_from_slice(b"<module>");
    image.extend_from_slice(&1u32.to_le_bytes()); // firstlineno
    image.push(b's'); // lnotab
    image.extend_from_slice(&0u32.to_le_bytes());

    assert_eq!(decompile(&image).unwrap(), "pass\n");
}

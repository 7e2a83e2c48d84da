//! Reconstructs a statement tree from one code object's instruction stream.
//!
//! A single forward pass keeps two pieces of state in sync: the symbolic
//! operand stack, which mirrors what the interpreter would have on its
//! evaluation stack but holds expression nodes, and the block stack, which
//! re-derives the nesting that the compiler flattened into jumps and
//! SETUP/POP markers. Every conditional jump snapshots the symbolic stack;
//! the snapshot is consumed when the path that never executed (the branch
//! target) becomes the current path.

use tracing::{error, warn};

use crate::ast::{
    Ast, Block, BlockInit, BlockKind, CmpOp, CondKind, Generator, KeywordKind, ReturnKind,
    SliceKind,
};
use crate::object::{Code, Value};
use crate::opcodes::{Cursor, Instr, Opcode};
use crate::stack::{FastStack, StackHistory};
use crate::{DepycError, Version};

#[cfg(test)]
mod tests;

/// What one decode pass produced. `clean` is false when an opcode without a
/// rule cut the pass short; the statements gathered up to that point are
/// still returned.
#[derive(Debug)]
pub struct BuildOutcome {
    pub tree: Ast,
    pub globals: Vec<String>,
    pub clean: bool,
}

pub fn build_from_code(code: &Code, version: Version) -> Result<BuildOutcome, DepycError> {
    Builder::new(code, version).run()
}

enum Flow {
    Continue,
    Abort,
}

struct Builder<'a> {
    code: &'a Code,
    version: Version,
    cursor: Cursor<'a>,
    stack: FastStack,
    stack_hist: StackHistory,
    blocks: Vec<Block>,
    /// Offset of the instruction that will be decoded next; jump targets
    /// and block ends are compared against it.
    pos: u32,
    /// Remaining stores of an UNPACK_* continuation.
    unpack: u32,
    else_pop: bool,
    need_try: bool,
    globals: Vec<String>,
    clean: bool,
}

impl<'a> Builder<'a> {
    fn new(code: &'a Code, version: Version) -> Builder<'a> {
        // The stack-size hint is unreliable on the 1.x line.
        let capacity = if version.major == 1 {
            20
        } else {
            (code.stack_size as usize).max(20)
        };
        let mut blocks = Vec::new();
        blocks.push(Block::inited(BlockKind::Main, 0));

        Builder {
            code,
            version,
            cursor: Cursor::new(&code.code, version),
            stack: FastStack::with_capacity(capacity),
            stack_hist: Vec::new(),
            blocks,
            pos: 0,
            unpack: 0,
            else_pop: false,
            need_try: false,
            globals: Vec::new(),
            clean: true,
        }
    }

    fn run(mut self) -> Result<BuildOutcome, DepycError> {
        while !self.cursor.at_eof() {
            let instr = self.cursor.next()?;
            self.pos = instr.next;
            self.pre_dispatch(&instr);
            match self.dispatch(instr)? {
                Flow::Continue => {}
                Flow::Abort => return Ok(self.finish()),
            }
            self.else_pop = matches!(
                self.cur().kind,
                BlockKind::Else
                    | BlockKind::Cond {
                        kind: CondKind::If | CondKind::Elif,
                        ..
                    }
            ) && self.cur().end == self.pos;
        }

        if !self.stack_hist.is_empty() {
            warn!(
                residue = self.stack_hist.len(),
                "snapshot history is not empty at end of stream"
            );
            self.stack_hist.clear();
        }
        if self.blocks.len() > 1 {
            warn!(
                residue = self.blocks.len() - 1,
                "block stack is not empty at end of stream"
            );
            while self.blocks.len() > 1 {
                let block = self.blocks.pop().expect("non-empty block stack");
                self.append(Ast::Block(Box::new(block)));
            }
        }

        Ok(self.finish())
    }

    fn finish(mut self) -> BuildOutcome {
        let main = self
            .blocks
            .drain(..)
            .next()
            .expect("block stack is never empty");
        BuildOutcome {
            tree: Ast::NodeList(main.nodes),
            globals: self.globals,
            clean: self.clean,
        }
    }

    fn cur(&self) -> &Block {
        self.blocks.last().expect("block stack is never empty")
    }

    fn cur_mut(&mut self) -> &mut Block {
        self.blocks.last_mut().expect("block stack is never empty")
    }

    fn append(&mut self, node: Ast) {
        self.cur_mut().nodes.push(node);
    }

    fn push_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    /// Pops the current block and folds it into its parent.
    fn close_block(&mut self) {
        if let Some(block) = self.blocks.pop() {
            self.append(Ast::Block(Box::new(block)));
        }
    }

    fn pop(&mut self) -> Ast {
        match self.stack.pop() {
            Some(node) => node,
            None => {
                // Exception-handler entries legitimately see values the
                // symbolic stack never modelled.
                tracing::debug!("symbolic stack underflow, substituting None");
                Ast::None
            }
        }
    }

    fn top(&self) -> Ast {
        self.stack.top().cloned().unwrap_or(Ast::None)
    }

    fn restore_stack(&mut self) {
        match self.stack_hist.pop() {
            Some(saved) => self.stack = saved,
            None => error!("snapshot history underflow"),
        }
    }

    fn checkpoint(&mut self) {
        self.stack_hist.push(self.stack.clone());
    }

    fn mark_global(&mut self, name: &str) {
        if !self.globals.iter().any(|g| g == name) {
            self.globals.push(name.to_string());
        }
    }

    fn local_name(&self, operand: u32) -> Result<String, DepycError> {
        // 1.0-1.2 code objects have no varname table.
        if self.version.before(1, 3) {
            Ok(self.code.get_name(operand)?.to_string())
        } else {
            Ok(self.code.get_varname(operand)?.to_string())
        }
    }

    /// Names like `_[1]` are list-comprehension accumulators; stores and
    /// deletes of them are compiler artifacts, not source.
    fn is_comp_temporary(name: &str) -> bool {
        name.as_bytes().first() == Some(&b'_') && name.as_bytes().get(1) == Some(&b'[')
    }

    /// A deferred try block (from SETUP_FINALLY) materialises on the first
    /// opcode that is not a SETUP_EXCEPT; an if/elif/else whose end offset
    /// has been reached closes on the first opcode that is not a jump or
    /// POP_BLOCK.
    fn pre_dispatch(&mut self, instr: &Instr) {
        if self.need_try && instr.opcode != Opcode::SetupExcept {
            self.need_try = false;
            self.checkpoint();
            let end = self.cur().end;
            self.push_block(Block::inited(BlockKind::Try, end));
        } else if self.else_pop
            && !instr.opcode.is_conditional_jump()
            && instr.opcode != Opcode::JumpForward
            && instr.opcode != Opcode::PopBlock
        {
            self.else_pop = false;
            loop {
                let prev = self.cur();
                if prev.end >= self.pos || prev.is_main() {
                    break;
                }
                if !prev.is_container() {
                    if prev.end == 0 {
                        break;
                    }
                    // The stack is already correct for this path; only the
                    // history level is retired.
                    self.stack_hist.pop();
                }
                self.close_block();
            }
        }
    }

    fn dispatch(&mut self, instr: Instr) -> Result<Flow, DepycError> {
        let Instr {
            opcode,
            operand,
            offset: curpos,
            next: pos,
            has_arg: _,
        } = instr;

        if let Some(op) = opcode.binary_op() {
            let right = self.pop();
            let left = self.pop();
            self.stack.push(Ast::binary(left, right, op));
            return Ok(Flow::Continue);
        }
        if let Some(op) = opcode.unary_op() {
            let operand = self.pop();
            self.stack.push(Ast::Unary {
                operand: Box::new(operand),
                op,
            });
            return Ok(Flow::Continue);
        }
        if let Some(kind) = opcode.load_slice() {
            let (lower, upper) = self.pop_slice_bounds(kind);
            let name = self.pop();
            let slice = Ast::slice(kind, lower, upper);
            self.stack.push(Ast::subscr(name, slice));
            return Ok(Flow::Continue);
        }
        if let Some(kind) = opcode.store_slice() {
            let (lower, upper) = self.pop_slice_bounds(kind);
            let dest = self.pop();
            let value = self.pop();
            let slice = Ast::slice(kind, lower, upper);
            self.append(Ast::store(value, Ast::subscr(dest, slice)));
            return Ok(Flow::Continue);
        }
        if let Some(kind) = opcode.delete_slice() {
            let (lower, upper) = self.pop_slice_bounds(kind);
            let name = self.pop();
            let slice = Ast::slice(kind, lower, upper);
            self.append(Ast::Delete(Box::new(Ast::subscr(name, slice))));
            return Ok(Flow::Continue);
        }
        if opcode.is_conditional_jump() {
            self.conditional_jump(opcode, operand, curpos, pos);
            return Ok(Flow::Continue);
        }

        match opcode {
            Opcode::BinarySubscr => {
                let key = self.pop();
                let name = self.pop();
                self.stack.push(Ast::subscr(name, key));
            }
            Opcode::BreakLoop => self.append(Ast::Keyword(KeywordKind::Break)),
            Opcode::BuildClass => {
                let code = self.pop();
                let bases = self.pop();
                let name = self.pop();
                self.stack.push(Ast::Class {
                    code: Box::new(code),
                    bases: Box::new(bases),
                    name: Box::new(name),
                });
            }
            Opcode::BuildFunction => {
                let code = self.pop();
                self.stack.push(Ast::Function {
                    code: Box::new(code),
                    defargs: Vec::new(),
                });
            }
            Opcode::BuildList => {
                let values = self.pop_reversed(operand);
                self.stack.push(Ast::List(values));
            }
            Opcode::BuildTuple => {
                let values = self.pop_reversed(operand);
                self.stack.push(Ast::Tuple(values));
            }
            Opcode::BuildMap => self.stack.push(Ast::Map(Vec::new())),
            Opcode::BuildSlice => self.build_slice(operand),
            Opcode::CallFunction => {
                let call = self.pop_call(operand, None, None);
                self.stack.push(call);
            }
            Opcode::CallFunctionVar => {
                let var = self.pop();
                let call = self.pop_call(operand, Some(var), None);
                self.stack.push(call);
            }
            Opcode::CallFunctionKw => {
                let kw = self.pop();
                let call = self.pop_call(operand, None, Some(kw));
                self.stack.push(call);
            }
            Opcode::CallFunctionVarKw => {
                let kw = self.pop();
                let var = self.pop();
                let call = self.pop_call(operand, Some(var), Some(kw));
                self.stack.push(call);
            }
            Opcode::UnaryCall => {
                let func = self.pop();
                self.stack.push(Ast::Call {
                    func: Box::new(func),
                    pparams: Vec::new(),
                    kwparams: Vec::new(),
                    var: None,
                    kw: None,
                });
            }
            Opcode::UnaryConvert => {
                let value = self.pop();
                self.stack.push(Ast::Convert(Box::new(value)));
            }
            Opcode::CompareOp => {
                let right = self.pop();
                let left = self.pop();
                self.stack.push(Ast::Compare {
                    left: Box::new(left),
                    right: Box::new(right),
                    op: CmpOp::from_operand(operand),
                });
            }
            Opcode::ContinueLoop => self.append(Ast::Keyword(KeywordKind::Continue)),
            Opcode::DeleteAttr => {
                let name = self.pop();
                let attr = Ast::attr(name, self.code.get_name(operand)?);
                self.append(Ast::Delete(Box::new(attr)));
            }
            Opcode::DeleteName | Opcode::DeleteGlobal => {
                let name = self.code.get_name(operand)?;
                if !Self::is_comp_temporary(name) {
                    let node = Ast::Name(name.to_string());
                    self.append(Ast::Delete(Box::new(node)));
                }
            }
            Opcode::DeleteFast => {
                let name = self.local_name(operand)?;
                if !Self::is_comp_temporary(&name) {
                    self.append(Ast::Delete(Box::new(Ast::Name(name))));
                }
            }
            Opcode::DeleteSubscr => {
                let key = self.pop();
                let name = self.pop();
                self.append(Ast::Delete(Box::new(Ast::subscr(name, key))));
            }
            Opcode::DupTop => {
                let top = self.top();
                self.stack.push(top);
            }
            Opcode::DupTopTwo => {
                let first = self.pop();
                let second = self.top();
                self.stack.push(first.clone());
                self.stack.push(second);
                self.stack.push(first);
            }
            Opcode::DupTopx => {
                let values = self.pop_reversed(operand);
                for value in &values {
                    self.stack.push(value.clone());
                }
                for value in values {
                    self.stack.push(value);
                }
            }
            Opcode::EndFinally => self.end_finally(pos),
            Opcode::ExecStmt => {
                let locals = self.pop();
                let globals = self.pop();
                let stmt = self.pop();
                self.append(Ast::Exec {
                    stmt: Box::new(stmt),
                    globals: Box::new(globals),
                    locals: Box::new(locals),
                });
            }
            Opcode::ForIter => {
                let iter = self.pop();
                self.open_for_block(iter);
                self.stack.push(Ast::None);
            }
            Opcode::ForLoop => {
                let index = self.pop();
                let iter = self.pop();
                self.open_for_block(iter.clone());
                // The interpreter pushes the sequence, the advanced counter
                // and the current item; only a placeholder is needed for
                // the item.
                self.stack.push(iter);
                self.stack.push(index);
                self.stack.push(Ast::None);
            }
            Opcode::GetIter => {}
            Opcode::ImportName => {
                if self.version.major == 1 {
                    self.stack.push(Ast::Import {
                        name: Box::new(Ast::Name(self.code.get_name(operand)?.to_string())),
                        fromlist: Box::new(Ast::None),
                        stores: Vec::new(),
                    });
                } else {
                    let fromlist = self.pop();
                    if self.version.at_least(2, 5) {
                        // Relative-import level, irrelevant for rendering.
                        self.pop();
                    }
                    self.stack.push(Ast::Import {
                        name: Box::new(Ast::Name(self.code.get_name(operand)?.to_string())),
                        fromlist: Box::new(fromlist),
                        stores: Vec::new(),
                    });
                }
            }
            Opcode::ImportFrom => {
                let name = self.code.get_name(operand)?.to_string();
                self.stack.push(Ast::Name(name));
            }
            Opcode::ImportStar => {
                let import = self.pop();
                self.append(Ast::store(import, Ast::None));
            }
            Opcode::JumpAbsolute => self.jump_absolute(operand, pos),
            Opcode::JumpForward => self.jump_forward(operand, pos),
            Opcode::ListAppend => {
                let value = self.pop();
                let list = self.top();
                if self.cur().is_comprehension() {
                    self.stack.push(Ast::Comprehension {
                        result: Box::new(value),
                        generators: Vec::new(),
                    });
                } else {
                    self.stack.push(Ast::subscr(list, value));
                }
            }
            Opcode::LoadAttr => {
                let is_import = matches!(self.stack.top(), Some(Ast::Import { .. }));
                if !is_import {
                    let name = self.pop();
                    let attr = Ast::attr(name, self.code.get_name(operand)?);
                    self.stack.push(attr);
                }
            }
            Opcode::LoadConst => {
                let value = self.code.get_const(operand)?;
                match value {
                    Value::Tuple(items) if items.is_empty() => {
                        self.stack.push(Ast::Tuple(Vec::new()));
                    }
                    Value::None => self.stack.push(Ast::None),
                    other => self.stack.push(Ast::Object(other.clone())),
                }
            }
            Opcode::LoadFast => {
                let name = self.local_name(operand)?;
                self.stack.push(Ast::Name(name));
            }
            Opcode::LoadGlobal | Opcode::LoadName => {
                let name = self.code.get_name(operand)?.to_string();
                self.stack.push(Ast::Name(name));
            }
            Opcode::LoadLocals => self.stack.push(Ast::Locals),
            Opcode::MakeFunction => {
                let code = self.pop();
                let defargs = self.pop_reversed(operand);
                self.stack.push(Ast::Function {
                    code: Box::new(code),
                    defargs,
                });
            }
            Opcode::PopBlock => self.pop_block(pos),
            Opcode::PopExcept => {}
            Opcode::PopTop => self.pop_top(),
            Opcode::PrintItem => {
                let value = self.pop();
                self.append(Ast::Print {
                    value: Box::new(value),
                    stream: Box::new(Ast::None),
                });
            }
            Opcode::PrintItemTo => {
                let stream = self.pop();
                let value = self.pop();
                self.append(Ast::Print {
                    value: Box::new(value),
                    stream: Box::new(stream),
                });
            }
            Opcode::PrintNewline => {
                self.append(Ast::Print {
                    value: Box::new(Ast::None),
                    stream: Box::new(Ast::None),
                });
            }
            Opcode::PrintNewlineTo => {
                let stream = self.pop();
                self.append(Ast::Print {
                    value: Box::new(Ast::None),
                    stream: Box::new(stream),
                });
            }
            Opcode::RaiseVarargs => {
                let params = self.pop_reversed(operand);
                self.append(Ast::Raise(params));
                self.eager_close_branch()?;
            }
            Opcode::ReturnValue => {
                let value = self.pop();
                self.append(Ast::Return {
                    value: Box::new(value),
                    kind: ReturnKind::Return,
                });
                self.eager_close_branch()?;
            }
            Opcode::YieldValue => {
                let value = self.pop();
                self.append(Ast::Return {
                    value: Box::new(value),
                    kind: ReturnKind::Yield,
                });
            }
            Opcode::RotTwo => {
                let one = self.pop();
                let two = self.pop();
                self.stack.push(one);
                self.stack.push(two);
            }
            Opcode::RotThree => {
                let one = self.pop();
                let two = self.pop();
                let three = self.pop();
                self.stack.push(one);
                self.stack.push(three);
                self.stack.push(two);
            }
            Opcode::RotFour => {
                let one = self.pop();
                let two = self.pop();
                let three = self.pop();
                let four = self.pop();
                self.stack.push(one);
                self.stack.push(four);
                self.stack.push(three);
                self.stack.push(two);
            }
            Opcode::SetLineno => {}
            Opcode::SetupExcept => {
                if let BlockKind::Container { except, .. } = &mut self.cur_mut().kind {
                    *except = pos + operand;
                } else {
                    self.push_block(Block::new(
                        BlockKind::Container {
                            except: pos + operand,
                            finally_at: 0,
                        },
                        0,
                    ));
                }
                // Snapshot for the handler path, which enters with the
                // pre-try stack.
                self.checkpoint();
                self.push_block(Block::inited(BlockKind::Try, pos + operand));
                self.need_try = false;
            }
            Opcode::SetupFinally => {
                self.push_block(Block::new(
                    BlockKind::Container {
                        except: 0,
                        finally_at: pos + operand,
                    },
                    0,
                ));
                self.need_try = true;
            }
            Opcode::SetupLoop => {
                self.push_block(Block::cond(
                    CondKind::While,
                    pos + operand,
                    Ast::None,
                    false,
                ));
            }
            Opcode::StoreAttr => {
                let name = self.pop();
                let value = self.pop();
                let attr = Ast::attr(name, self.code.get_name(operand)?);
                self.append(Ast::store(value, attr));
            }
            Opcode::StoreFast => {
                let name = self.local_name(operand)?;
                if self.unpack > 0 {
                    self.unpack_store(Ast::Name(name), false);
                } else {
                    let value = self.pop();
                    if Self::is_comp_temporary(&name) {
                        return Ok(Flow::Continue);
                    }
                    let name = Ast::Name(name);
                    if self.set_for_index(name.clone()) {
                        return Ok(Flow::Continue);
                    }
                    self.append(Ast::store(value, name));
                }
            }
            Opcode::StoreGlobal => {
                let value = self.pop();
                let name = self.code.get_name(operand)?.to_string();
                self.mark_global(&name);
                self.append(Ast::store(value, Ast::Name(name)));
            }
            Opcode::StoreName => {
                let name = self.code.get_name(operand)?.to_string();
                if self.unpack > 0 {
                    self.unpack_store(Ast::Name(name), true);
                } else {
                    let value = self.pop();
                    if Self::is_comp_temporary(&name) {
                        return Ok(Flow::Continue);
                    }
                    let name = Ast::Name(name);
                    if self.set_for_index(name.clone()) {
                        return Ok(Flow::Continue);
                    }
                    if let Some(Ast::Import { stores, .. }) = self.stack.top_mut() {
                        stores.push((value, name));
                    } else {
                        self.append(Ast::store(value, name));
                    }
                }
            }
            Opcode::StoreSubscr => {
                let key = self.pop();
                let dest = self.pop();
                let value = self.pop();
                if matches!(dest, Ast::Map(_)) {
                    // The popped map is a DUP of the one still on the
                    // stack; grow that one.
                    if let Some(Ast::Map(pairs)) = self.stack.top_mut() {
                        pairs.push((key, value));
                    } else {
                        error!("map store with no map on the stack");
                        self.append(Ast::store(value, Ast::subscr(dest, key)));
                    }
                } else {
                    self.append(Ast::store(value, Ast::subscr(dest, key)));
                }
            }
            Opcode::UnpackList | Opcode::UnpackTuple | Opcode::UnpackSequence => {
                self.unpack = operand;
                self.stack.push(Ast::Tuple(Vec::new()));
            }
            _ => {
                warn!(opcode = opcode.name(), "unsupported opcode");
                self.clean = false;
                return Ok(Flow::Abort);
            }
        }
        Ok(Flow::Continue)
    }

    fn pop_slice_bounds(&mut self, kind: SliceKind) -> (Ast, Ast) {
        match kind {
            SliceKind::Slice0 => (Ast::None, Ast::None),
            SliceKind::Slice1 => (self.pop(), Ast::None),
            SliceKind::Slice2 => (Ast::None, self.pop()),
            SliceKind::Slice3 => {
                let upper = self.pop();
                let lower = self.pop();
                (lower, upper)
            }
        }
    }

    fn pop_reversed(&mut self, count: u32) -> Vec<Ast> {
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(self.pop());
        }
        values.reverse();
        values
    }

    fn pop_call(&mut self, operand: u32, var: Option<Ast>, kw: Option<Ast>) -> Ast {
        let kwparams = (operand & 0xFF00) >> 8;
        let pparams = operand & 0xFF;
        let mut kwparam_list = Vec::with_capacity(kwparams as usize);
        for _ in 0..kwparams {
            let value = self.pop();
            let key = self.pop();
            kwparam_list.push((key, value));
        }
        kwparam_list.reverse();
        let pparam_list = self.pop_reversed(pparams);
        let func = self.pop();
        Ast::Call {
            func: Box::new(func),
            pparams: pparam_list,
            kwparams: kwparam_list,
            var: var.map(Box::new),
            kw: kw.map(Box::new),
        }
    }

    fn build_slice(&mut self, operand: u32) {
        fn normalize(node: Ast) -> Ast {
            match node {
                Ast::Object(Value::None) => Ast::None,
                other => other,
            }
        }
        fn pair(start: Ast, end: Ast) -> Ast {
            match (start.is_none(), end.is_none()) {
                (true, true) => Ast::slice(SliceKind::Slice0, Ast::None, Ast::None),
                (true, false) => Ast::slice(SliceKind::Slice2, start, end),
                (false, true) => Ast::slice(SliceKind::Slice1, start, end),
                (false, false) => Ast::slice(SliceKind::Slice3, start, end),
            }
        }

        if operand == 2 {
            let end = normalize(self.pop());
            let start = normalize(self.pop());
            self.stack.push(pair(start, end));
        } else if operand == 3 {
            let step = normalize(self.pop());
            let end = normalize(self.pop());
            let start = normalize(self.pop());
            // A step slice nests: the start:stop pair becomes the left
            // operand of an outer slice carrying the step.
            let inner = pair(start, end);
            let outer = if step.is_none() {
                Ast::slice(SliceKind::Slice1, inner, step)
            } else {
                Ast::slice(SliceKind::Slice3, inner, step)
            };
            self.stack.push(outer);
        } else {
            warn!(operand, "BUILD_SLICE with unexpected operand count");
        }
    }

    fn open_for_block(&mut self, iter: Ast) {
        let (end, comprehension) = if self.cur().is_cond(CondKind::While) {
            let pending = self.blocks.pop().expect("checked current block");
            (pending.end, false)
        } else {
            (self.cur().end, true)
        };
        self.push_block(Block::new(
            BlockKind::For {
                iter,
                index: Ast::None,
                comprehension,
            },
            end,
        ));
    }

    /// First store into a fresh for block names the loop index instead of
    /// producing an assignment.
    fn set_for_index(&mut self, index: Ast) -> bool {
        let cur = self.cur_mut();
        if cur.init.is_set() || !cur.is_for() {
            return false;
        }
        if let BlockKind::For { index: slot, .. } = &mut cur.kind {
            *slot = index;
        }
        cur.init = BlockInit::Inited;
        true
    }

    fn unpack_store(&mut self, name: Ast, check_for_index: bool) {
        match self.stack.top_mut() {
            Some(Ast::Tuple(values)) => values.push(name),
            _ => error!("unpack continuation without a tuple on the stack"),
        }
        self.unpack -= 1;
        if self.unpack == 0 {
            let tup = self.pop();
            let seq = self.pop();
            if check_for_index && self.set_for_index(tup.clone()) {
                return;
            }
            self.append(Ast::store(seq, tup));
        }
    }

    fn pop_top(&mut self) {
        let value = self.pop();
        if !self.cur().init.is_set() {
            // A leftover short-circuit condition; consuming it arms the
            // block.
            self.cur_mut().init = BlockInit::Inited;
            return;
        }
        match &value {
            Ast::None | Ast::Binary { .. } | Ast::Name(_) => return,
            Ast::Compare {
                op: CmpOp::Exception,
                ..
            } => return,
            _ => {}
        }

        let comprehension_call = if self.cur().is_comprehension() {
            match &value {
                Ast::Call { pparams, .. } => pparams.first().cloned(),
                _ => None,
            }
        } else {
            None
        };
        self.append(value);
        if let Some(result) = comprehension_call {
            self.stack.push(Ast::Comprehension {
                result: Box::new(result),
                generators: Vec::new(),
            });
        }
    }

    fn conditional_jump(&mut self, opcode: Opcode, operand: u32, curpos: u32, pos: u32) {
        let cond = self.top();
        let mut popped = BlockInit::Uninited;

        if matches!(opcode, Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue) {
            self.pop();
            popped = BlockInit::PrePopped;
        }

        // Save the stack the else path will resume from.
        self.checkpoint();

        if matches!(opcode, Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop) {
            self.pop();
            popped = BlockInit::Popped;
        }

        // "Jump if true" guards a negated condition.
        let neg = matches!(
            opcode,
            Opcode::JumpIfTrue | Opcode::JumpIfTrueOrPop | Opcode::PopJumpIfTrue
        );
        let offs = if matches!(opcode, Opcode::JumpIfFalse | Opcode::JumpIfTrue) {
            pos + operand
        } else {
            operand
        };

        let exception_cond = match &cond {
            Ast::Compare {
                op: CmpOp::Exception,
                right,
                ..
            } => Some((**right).clone()),
            _ => None,
        };

        let mut ifblk = if let Some(right) = exception_cond {
            if self.cur().is_cond(CondKind::Except) {
                let unset = matches!(
                    &self.cur().kind,
                    BlockKind::Cond { cond, .. } if cond.is_none()
                );
                if unset {
                    self.blocks.pop();
                    self.stack_hist.pop();
                }
            }
            Block::cond(CondKind::Except, offs, right, false)
        } else if self.cur().is_else() && self.cur().nodes.is_empty() {
            // An empty else followed by another test is an elif.
            self.blocks.pop();
            self.restore_stack();
            Block::cond(CondKind::Elif, offs, cond, neg)
        } else if self.cur().nodes.is_empty()
            && !self.cur().init.is_set()
            && self.cur().is_cond(CondKind::While)
        {
            // The pending loop finally met its condition. Loops don't keep
            // a snapshot, so drop the one pushed above.
            self.blocks.pop();
            self.stack_hist.pop();
            Block::cond(CondKind::While, offs, cond, neg)
        } else if self.cur().nodes.is_empty()
            && self.cur().end <= offs
            && matches!(
                self.cur().cond_kind(),
                Some(CondKind::If | CondKind::Elif | CondKind::While)
            )
        {
            // Two tests guarding the same body: a short-circuit pair.
            let top = self.blocks.pop().expect("checked current block");
            let (top_kind, cond1, top_negative) = match top.kind {
                BlockKind::Cond {
                    kind,
                    cond,
                    negative,
                } => (kind, cond, negative),
                _ => unreachable!("matched a cond block above"),
            };
            if top_kind == CondKind::While {
                self.stack_hist.pop();
            } else {
                // Keep the newest snapshot, retire the one belonging to
                // the absorbed test.
                if let Some(newest) = self.stack_hist.pop() {
                    self.stack_hist.pop();
                    self.stack_hist.push(newest);
                }
            }
            let op = if top.end == offs || (top.end == curpos && !top_negative) {
                crate::ast::BinOp::LogAnd
            } else {
                crate::ast::BinOp::LogOr
            };
            Block::cond(top_kind, offs, Ast::binary(cond1, cond, op), neg)
        } else {
            Block::cond(CondKind::If, offs, cond, neg)
        };

        if popped.is_set() {
            ifblk.init = popped;
        }
        self.push_block(ifblk);
    }

    fn jump_absolute(&mut self, operand: u32, pos: u32) {
        if operand < pos {
            // Back-edge of a loop.
            if self.cur().is_comprehension() {
                let block = self.blocks.pop().expect("checked current block");
                if let BlockKind::For { iter, index, .. } = block.kind {
                    if let Some(Ast::Comprehension { generators, .. }) = self.stack.top_mut() {
                        generators.push(Generator { index, iter });
                    }
                }
            } else {
                self.append(Ast::Keyword(KeywordKind::Continue));
            }
            return;
        }

        if self.cur().is_container() {
            let (has_except, except) = match self.cur().kind {
                BlockKind::Container { except, .. } => (except != 0, except),
                _ => unreachable!("checked container above"),
            };
            if has_except && pos < except {
                self.push_block(Block::inited(
                    BlockKind::Cond {
                        kind: CondKind::Except,
                        cond: Ast::None,
                        negative: false,
                    },
                    0,
                ));
            }
            return;
        }

        self.restore_stack();
        self.close_branches(None, false);
    }

    fn jump_forward(&mut self, operand: u32, pos: u32) {
        if self.cur().is_container() {
            if self.cur().has_except() {
                self.checkpoint();
                self.cur_mut().end = pos + operand;
                let mut except = Block::cond(CondKind::Except, pos + operand, Ast::None, false);
                except.init = BlockInit::Inited;
                self.push_block(except);
            }
            return;
        }

        if self.cur().is_cond(CondKind::While) && !self.cur().init.is_set() {
            // An unconditional loop; fake a truthy test for the closing
            // logic to consume.
            self.stack.push(Ast::Object(Value::Int(1)));
            return;
        }

        let no_arm = operand == 0;
        self.restore_stack();
        self.close_branches(Some(pos + operand), no_arm);

        if self.cur().is_cond(CondKind::Except) {
            self.cur_mut().end = pos + operand;
        }
    }

    /// Shared tail of the forward-jump rules: fold finished branches into
    /// their parents and open the else/except arms their jumps imply.
    /// `target` carries the jump target for JUMP_FORWARD; JUMP_ABSOLUTE
    /// reuses the parent's end offset. A zero-length forward jump closes
    /// the branch without opening an arm.
    fn close_branches(&mut self, target: Option<u32>, no_arm: bool) {
        let mut push = true;
        loop {
            if self.blocks.len() < 2 {
                error!("branch close walked off the block stack");
                return;
            }
            let prev = self.blocks.pop().expect("checked length above");
            let prev_kind = prev.cond_kind();
            let prev_is_else = prev.is_else();
            let prev_init = prev.init;
            self.append(Ast::Block(Box::new(prev)));

            match prev_kind {
                Some(CondKind::If) | Some(CondKind::Elif) => {
                    if no_arm {
                        return;
                    }
                    let end = target.unwrap_or_else(|| self.cur().end);
                    if push {
                        self.checkpoint();
                    }
                    let mut next = Block::new(BlockKind::Else, end);
                    if prev_init == BlockInit::PrePopped {
                        next.init = BlockInit::PrePopped;
                    }
                    self.push_block(next);
                    return;
                }
                Some(CondKind::Except) => {
                    if no_arm {
                        return;
                    }
                    let end = target.unwrap_or_else(|| self.cur().end);
                    if push {
                        self.checkpoint();
                    }
                    let mut next = Block::cond(CondKind::Except, end, Ast::None, false);
                    next.init = BlockInit::Inited;
                    self.push_block(next);
                    return;
                }
                _ if prev_is_else => {
                    // An else closed by this jump keeps walking outward;
                    // no arm is opened for an else-of-else.
                    if !push {
                        self.restore_stack();
                    }
                    push = false;
                }
                _ => return,
            }
        }
    }

    fn pop_block(&mut self, pos: u32) {
        if self.cur().is_container() || self.cur().is_finally() {
            // Those close on END_FINALLY instead.
            return;
        }

        if matches!(self.cur().nodes.last(), Some(Ast::Keyword(_))) {
            self.cur_mut().nodes.pop();
        }

        let restores = matches!(
            self.cur().kind,
            BlockKind::Else | BlockKind::Try | BlockKind::Finally
        ) || matches!(
            self.cur().cond_kind(),
            Some(CondKind::If | CondKind::Elif | CondKind::Except)
        );
        if restores {
            self.restore_stack();
        }

        let tmp = self.blocks.pop().expect("block stack is never empty");
        let mut tmp_tag = BlockTag::of(&tmp);
        let tmp_end = tmp.end;
        let keep = !(tmp.is_else() && tmp.nodes.is_empty());
        if keep {
            self.append(Ast::Block(Box::new(tmp)));
        }

        if tmp_tag == BlockTag::For && tmp_end > pos {
            // The loop has an else clause covering the rest of its range.
            self.checkpoint();
            self.push_block(Block::new(BlockKind::Else, tmp_end));
        }

        if self.cur().is_try() && tmp_tag != BlockTag::For && tmp_tag != BlockTag::While {
            self.restore_stack();
            let tmp = self.blocks.pop().expect("block stack is never empty");
            tmp_tag = BlockTag::of(&tmp);
            let keep = !(tmp.is_else() && tmp.nodes.is_empty());
            if keep {
                self.append(Ast::Block(Box::new(tmp)));
            }
        }

        if self.cur().is_container() {
            let has_finally = self.cur().has_finally();
            let has_except = self.cur().has_except();
            if tmp_tag == BlockTag::Else && !has_finally {
                let cont = self.blocks.pop().expect("block stack is never empty");
                self.append(Ast::Block(Box::new(cont)));
            } else if (tmp_tag == BlockTag::Else && has_finally)
                || (tmp_tag == BlockTag::Try && !has_except)
            {
                self.checkpoint();
                self.push_block(Block::inited(BlockKind::Finally, 0));
            }
        }
    }

    fn end_finally(&mut self, pos: u32) {
        let mut is_finally = false;
        if self.cur().is_finally() {
            let fin = self.blocks.pop().expect("block stack is never empty");
            self.restore_stack();
            self.append(Ast::Block(Box::new(fin)));
            is_finally = true;
        } else if self.cur().is_cond(CondKind::Except) {
            let prev = self.blocks.pop().expect("block stack is never empty");
            let prev_end = prev.end;
            if !prev.nodes.is_empty() {
                self.append(Ast::Block(Box::new(prev)));
            }

            if self.cur().end != pos || self.cur().has_finally() {
                // More of the container remains; an empty else soaks up
                // whatever follows the handlers.
                self.push_block(Block::inited(BlockKind::Else, prev_end));
            } else {
                self.restore_stack();
            }
        }

        if self.cur().is_container() {
            let has_finally = self.cur().has_finally();
            if !has_finally || is_finally {
                let cont = self.blocks.pop().expect("block stack is never empty");
                self.append(Ast::Block(Box::new(cont)));
            }
        }
    }

    /// From 2.6 on the compiler leaves a jump after a return or raise that
    /// terminates a branch; close the branch now and swallow that jump.
    fn eager_close_branch(&mut self) -> Result<(), DepycError> {
        let in_branch = self.cur().is_cond(CondKind::If) || self.cur().is_else();
        if in_branch && !self.stack_hist.is_empty() && self.version.at_least(2, 6) {
            self.restore_stack();
            self.close_block();
            if !self.cursor.at_eof() {
                let skipped = self.cursor.next()?;
                self.pos = skipped.next;
            }
        }
        Ok(())
    }
}

/// Cheap discriminant for the closing rules, which compare block kinds
/// after the block itself has been folded into the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockTag {
    Main,
    Try,
    Else,
    Finally,
    If,
    Elif,
    While,
    Except,
    For,
    Container,
}

impl BlockTag {
    fn of(block: &Block) -> BlockTag {
        match &block.kind {
            BlockKind::Main => BlockTag::Main,
            BlockKind::Try => BlockTag::Try,
            BlockKind::Else => BlockTag::Else,
            BlockKind::Finally => BlockTag::Finally,
            BlockKind::Cond { kind, .. } => match kind {
                CondKind::If => BlockTag::If,
                CondKind::Elif => BlockTag::Elif,
                CondKind::While => BlockTag::While,
                CondKind::Except => BlockTag::Except,
            },
            BlockKind::For { .. } => BlockTag::For,
            BlockKind::Container { .. } => BlockTag::Container,
        }
    }
}

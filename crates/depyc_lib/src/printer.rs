//! Renders the reconstructed tree back to source text.
//!
//! A top-down walk with an explicit render context: indentation depth, the
//! in-print flag that glues chained `print` statements back together, and
//! the pending-globals flag set while a `def` body is being emitted.
//! Parenthesisation is decided by comparing operator ranks between parent
//! and child nodes.

use std::fmt::Write;
use std::rc::Rc;

use tracing::warn;

use crate::ast::{Ast, BinOp, Block, BlockKind, CondKind, ReturnKind, UnaryOp};
use crate::builder;
use crate::object::{Code, Module, Value};
use crate::opcodes::Cursor;
use crate::{DepycError, Version};

/// Decompiles the module code object and writes source text to `w`.
pub fn render_source<W: Write>(w: &mut W, module: &Module) -> Result<(), DepycError> {
    let mut printer = Printer::new(w, module.version);
    printer.decompile_code(&module.code)
}

/// Writes a plain instruction listing instead of source.
pub fn render_disassembly<W: Write>(w: &mut W, module: &Module) -> Result<(), DepycError> {
    disasm_code(w, &module.code, module.version)
}

struct Printer<'w, W> {
    w: &'w mut W,
    version: Version,
    indent: i32,
    in_print: bool,
    print_globals: bool,
}

/// Positive when the child binds looser than the parent and needs parens.
fn cmp_prec(parent: &Ast, child: &Ast) -> i32 {
    if matches!(
        parent,
        Ast::Unary {
            op: UnaryOp::Not,
            ..
        }
    ) {
        // not(x) reads wrong without parens no matter the child.
        return 1;
    }
    match child {
        Ast::Binary { op: child_op, .. } => match parent {
            Ast::Binary { op: parent_op, .. } => child_op.rank() - parent_op.rank(),
            Ast::Compare { .. } => {
                if matches!(child_op, BinOp::LogAnd | BinOp::LogOr) {
                    1
                } else {
                    -1
                }
            }
            Ast::Unary { .. } => {
                if *child_op == BinOp::Power {
                    -1
                } else {
                    1
                }
            }
            _ => -1,
        },
        Ast::Unary { op: child_op, .. } => match parent {
            Ast::Binary { op: parent_op, .. } => {
                if matches!(parent_op, BinOp::LogAnd | BinOp::LogOr) {
                    -1
                } else if *child_op == UnaryOp::Not {
                    1
                } else if *parent_op == BinOp::Power {
                    // Right-associative power binds tighter than any unary.
                    1
                } else {
                    -1
                }
            }
            Ast::Compare { .. } => {
                if *child_op == UnaryOp::Not {
                    1
                } else {
                    -1
                }
            }
            Ast::Unary { op: parent_op, .. } => child_op.rank() - parent_op.rank(),
            _ => -1,
        },
        Ast::Compare { op: child_op, .. } => match parent {
            Ast::Binary { op: parent_op, .. } => {
                if matches!(parent_op, BinOp::LogAnd | BinOp::LogOr) {
                    -1
                } else {
                    1
                }
            }
            Ast::Compare { op: parent_op, .. } => child_op.rank() - parent_op.rank(),
            Ast::Unary { op: parent_op, .. } => {
                if *parent_op == UnaryOp::Not {
                    -1
                } else {
                    1
                }
            }
            _ => -1,
        },
        _ => -1,
    }
}

impl<'w, W: Write> Printer<'w, W> {
    fn new(w: &'w mut W, version: Version) -> Printer<'w, W> {
        Printer {
            w,
            version,
            indent: -1,
            in_print: false,
            print_globals: false,
        }
    }

    fn start_line(&mut self) -> Result<(), DepycError> {
        self.start_line_at(self.indent)
    }

    fn start_line_at(&mut self, indent: i32) -> Result<(), DepycError> {
        if self.in_print {
            return Ok(());
        }
        for _ in 0..indent.max(0) {
            self.w.write_str("    ")?;
        }
        Ok(())
    }

    fn end_line(&mut self) -> Result<(), DepycError> {
        if self.in_print {
            return Ok(());
        }
        self.w.write_char('\n')?;
        Ok(())
    }

    /// Decompiles one code object and prints it at the current indent.
    /// The compiler's own scaffolding (`__module__ = __name__`, the
    /// trailing bare return) is stripped before printing.
    fn decompile_code(&mut self, code: &Rc<Code>) -> Result<(), DepycError> {
        let outcome = builder::build_from_code(code, self.version)?;
        let mut nodes = match outcome.tree {
            Ast::NodeList(nodes) => nodes,
            other => vec![other],
        };

        if outcome.clean {
            let module_store = matches!(
                nodes.first(),
                Some(Ast::Store { src, dest })
                    if matches!(&**src, Ast::Name(n) if n == "__name__")
                        && matches!(&**dest, Ast::Name(n) if n == "__module__")
            );
            if module_store {
                nodes.remove(0);
            }
            let trailing_return = matches!(
                nodes.last(),
                Some(Ast::Return { value, kind: ReturnKind::Return })
                    if matches!(&**value, Ast::None | Ast::Locals)
            );
            if trailing_return {
                nodes.pop();
            }
        }
        if nodes.is_empty() {
            nodes.push(Ast::Pass);
        }

        self.in_print = false;

        if self.print_globals && !outcome.globals.is_empty() {
            self.start_line_at(self.indent + 1)?;
            self.w.write_str("global ")?;
            for (i, name) in outcome.globals.iter().enumerate() {
                if i > 0 {
                    self.w.write_str(", ")?;
                }
                self.w.write_str(name)?;
            }
            self.w.write_char('\n')?;
        }
        self.print_globals = false;

        self.print_src(&Ast::NodeList(nodes))?;

        if !outcome.clean {
            self.start_line()?;
            self.w.write_str("# WARNING: Decompyle incomplete\n")?;
        }
        Ok(())
    }

    fn print_ordered(&mut self, parent: &Ast, child: &Ast) -> Result<(), DepycError> {
        match child {
            Ast::Binary { .. } | Ast::Compare { .. } | Ast::Unary { .. } => {
                if cmp_prec(parent, child) > 0 {
                    self.w.write_char('(')?;
                    self.print_src(child)?;
                    self.w.write_char(')')?;
                } else {
                    self.print_src(child)?;
                }
            }
            _ => self.print_src(child)?,
        }
        Ok(())
    }

    fn print_block_body(&mut self, block: &Block) -> Result<(), DepycError> {
        if block.nodes.is_empty() {
            self.start_line()?;
            self.print_src(&Ast::Pass)?;
        }
        let mut nodes = block.nodes.iter().peekable();
        while let Some(node) = nodes.next() {
            if !matches!(node, Ast::NodeList(_)) {
                self.start_line()?;
            }
            self.print_src(node)?;
            if nodes.peek().is_some() {
                self.end_line()?;
            }
        }
        Ok(())
    }

    fn print_params(&mut self, code: &Code, defargs: &[Ast]) -> Result<(), DepycError> {
        let argc = code.arg_count as usize;
        let mut first = true;
        for i in 0..argc {
            if !first {
                self.w.write_str(", ")?;
            }
            let name = code.varnames.get(i).map(String::as_str).unwrap_or("?");
            self.w.write_str(name)?;
            if argc - i <= defargs.len() {
                self.w.write_str(" = ")?;
                self.print_src(&defargs[defargs.len() - (argc - i)])?;
            }
            first = false;
        }
        if code.flags & Code::CO_VARARGS != 0 {
            if !first {
                self.w.write_str(", ")?;
            }
            let name = code.varnames.get(argc).map(String::as_str).unwrap_or("args");
            write!(self.w, "*{name}")?;
            first = false;
        }
        if code.flags & Code::CO_VARKEYWORDS != 0 {
            if !first {
                self.w.write_str(", ")?;
            }
            let mut index = argc;
            if code.flags & Code::CO_VARARGS != 0 {
                index += 1;
            }
            let name = code
                .varnames
                .get(index)
                .map(String::as_str)
                .unwrap_or("kwargs");
            write!(self.w, "**{name}")?;
        }
        Ok(())
    }

    fn print_block_node(&mut self, block: &Block) -> Result<(), DepycError> {
        if block.is_else() && block.nodes.is_empty() {
            return Ok(());
        }
        if block.is_container() {
            // A try/except scaffold renders its parts transparently.
            self.end_line()?;
            self.print_block_body(block)?;
            self.end_line()?;
            return Ok(());
        }

        self.in_print = false;
        self.w.write_str(block.keyword())?;
        match &block.kind {
            BlockKind::Cond {
                kind: CondKind::If | CondKind::Elif | CondKind::While,
                cond,
                negative,
            } => {
                self.w.write_str(if *negative { " not " } else { " " })?;
                self.print_src(cond)?;
            }
            BlockKind::Cond {
                kind: CondKind::Except,
                cond,
                ..
            } => {
                if !cond.is_none() {
                    self.w.write_char(' ')?;
                    self.print_src(cond)?;
                }
            }
            BlockKind::For { iter, index, .. } => {
                self.w.write_char(' ')?;
                self.print_src(index)?;
                self.w.write_str(" in ")?;
                self.print_src(iter)?;
            }
            _ => {}
        }
        self.w.write_str(":\n")?;

        self.indent += 1;
        self.print_block_body(block)?;
        if self.in_print {
            self.w.write_char(',')?;
        }
        self.indent -= 1;
        self.in_print = false;
        Ok(())
    }

    fn print_store(&mut self, src: &Ast, dest: &Ast) -> Result<(), DepycError> {
        match src {
            Ast::Function { code, defargs } => {
                self.w.write_char('\n')?;
                self.start_line()?;
                self.w.write_str("def ")?;
                self.print_src(dest)?;
                self.w.write_char('(')?;
                if let Ast::Object(Value::Code(code_src)) = &**code {
                    let code_src = code_src.clone();
                    self.print_params(&code_src, defargs)?;
                    self.w.write_str("):\n")?;
                    self.print_globals = true;
                    self.decompile_code(&code_src)?;
                } else {
                    warn!("function body is not a code constant");
                    self.w.write_str("):\n")?;
                    self.indent += 1;
                    self.start_line()?;
                    self.w.write_str("pass")?;
                    self.indent -= 1;
                }
            }
            Ast::Class { code, bases, .. } => {
                self.w.write_char('\n')?;
                self.start_line()?;
                self.w.write_str("class ")?;
                self.print_src(dest)?;
                let base_values = match &**bases {
                    Ast::Tuple(values) => values.as_slice(),
                    _ => &[],
                };
                if !base_values.is_empty() {
                    self.w.write_char('(')?;
                    for (i, base) in base_values.iter().enumerate() {
                        if i > 0 {
                            self.w.write_str(", ")?;
                        }
                        self.print_src(base)?;
                    }
                    self.w.write_str("):\n")?;
                } else {
                    // No parens without base classes.
                    self.w.write_str(":\n")?;
                }
                // The class body hides behind a call to the body function.
                let body = match &**code {
                    Ast::Call { func, .. } => match &**func {
                        Ast::Function { code, .. } => Some(code),
                        _ => None,
                    },
                    _ => None,
                };
                match body {
                    Some(body) => self.print_src(body)?,
                    None => {
                        warn!("class body has an unexpected shape");
                        self.indent += 1;
                        self.start_line()?;
                        self.w.write_str("pass")?;
                        self.indent -= 1;
                    }
                }
            }
            Ast::Import { name, fromlist, .. } => {
                let from_names: Option<Vec<String>> = match &**fromlist {
                    Ast::Object(Value::Tuple(items)) => Some(
                        items
                            .iter()
                            .map(|v| match v {
                                Value::Str(s) | Value::Unicode(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .collect(),
                    ),
                    Ast::Object(Value::Str(s)) => Some(vec![s.clone()]),
                    _ => None,
                };
                match from_names {
                    Some(names) => {
                        self.w.write_str("from ")?;
                        self.print_import_target(name)?;
                        self.w.write_str(" import ")?;
                        for (i, n) in names.iter().enumerate() {
                            if i > 0 {
                                self.w.write_str(", ")?;
                            }
                            self.w.write_str(n)?;
                        }
                    }
                    None => {
                        self.w.write_str("import ")?;
                        self.print_src(name)?;
                    }
                }
            }
            Ast::Binary { op, .. } if op.is_inplace() => {
                self.print_src(src)?;
            }
            _ => {
                let docstring = matches!(dest, Ast::Name(n) if n == "__doc__");
                if docstring {
                    if let Ast::Object(v @ (Value::Str(_) | Value::Unicode(_))) = src {
                        // Docstrings come back as bare literals.
                        return self.print_const(v);
                    }
                }
                self.print_src(dest)?;
                self.w.write_str(" = ")?;
                self.print_src(src)?;
            }
        }
        Ok(())
    }

    fn print_import_target(&mut self, name: &Ast) -> Result<(), DepycError> {
        match name {
            Ast::Import { name, .. } => self.print_src(name),
            other => self.print_src(other),
        }
    }

    fn print_src(&mut self, node: &Ast) -> Result<(), DepycError> {
        match node {
            Ast::None => self.w.write_str("None")?,
            Ast::Pass => self.w.write_str("pass")?,
            Ast::Locals => self.w.write_str("locals()")?,
            Ast::Name(name) => self.w.write_str(name)?,
            Ast::Object(value) => match value {
                Value::Code(code) => {
                    let code = code.clone();
                    self.decompile_code(&code)?;
                }
                other => self.print_const(other)?,
            },
            Ast::Binary { left, right, op } => {
                self.print_ordered(node, left)?;
                self.w.write_str(op.op_str())?;
                self.print_ordered(node, right)?;
            }
            Ast::Compare { left, right, op } => {
                self.print_ordered(node, left)?;
                self.w.write_str(op.op_str())?;
                self.print_ordered(node, right)?;
            }
            Ast::Unary { operand, op } => {
                self.w.write_str(op.op_str())?;
                self.print_ordered(node, operand)?;
            }
            Ast::Call {
                func,
                pparams,
                kwparams,
                var,
                kw,
            } => {
                self.print_src(func)?;
                self.w.write_char('(')?;
                let mut first = true;
                for param in pparams {
                    if !first {
                        self.w.write_str(", ")?;
                    }
                    self.print_src(param)?;
                    first = false;
                }
                for (key, value) in kwparams {
                    if !first {
                        self.w.write_str(", ")?;
                    }
                    match key {
                        Ast::Name(n) => self.w.write_str(n)?,
                        Ast::Object(Value::Str(s) | Value::Unicode(s)) => self.w.write_str(s)?,
                        other => self.print_src(other)?,
                    }
                    self.w.write_str(" = ")?;
                    self.print_src(value)?;
                    first = false;
                }
                if let Some(var) = var {
                    if !first {
                        self.w.write_str(", ")?;
                    }
                    self.w.write_char('*')?;
                    self.print_src(var)?;
                    first = false;
                }
                if let Some(kw) = kw {
                    if !first {
                        self.w.write_str(", ")?;
                    }
                    self.w.write_str("**")?;
                    self.print_src(kw)?;
                }
                self.w.write_char(')')?;
            }
            Ast::Subscr { name, key } => {
                self.print_src(name)?;
                self.w.write_char('[')?;
                self.print_src(key)?;
                self.w.write_char(']')?;
            }
            Ast::Slice { kind, lower, upper } => {
                if kind.has_lower() {
                    self.print_src(lower)?;
                }
                self.w.write_char(':')?;
                if kind.has_upper() {
                    self.print_src(upper)?;
                }
            }
            Ast::Tuple(values) => {
                self.w.write_char('(')?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        self.w.write_str(", ")?;
                    }
                    self.print_src(value)?;
                }
                if values.len() == 1 {
                    self.w.write_str(",)")?;
                } else {
                    self.w.write_char(')')?;
                }
            }
            Ast::List(values) => {
                self.w.write_char('[')?;
                self.indent += 1;
                for (i, value) in values.iter().enumerate() {
                    self.w.write_str(if i == 0 { "\n" } else { ",\n" })?;
                    self.start_line()?;
                    self.print_src(value)?;
                }
                self.indent -= 1;
                self.w.write_char(']')?;
            }
            Ast::Map(pairs) => {
                self.w.write_char('{')?;
                self.indent += 1;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    self.w.write_str(if i == 0 { "\n" } else { ",\n" })?;
                    self.start_line()?;
                    self.print_src(key)?;
                    self.w.write_str(": ")?;
                    self.print_src(value)?;
                }
                self.indent -= 1;
                self.w.write_str(" }")?;
            }
            Ast::Comprehension { result, generators } => {
                self.w.write_str("[ ")?;
                self.print_src(result)?;
                for generator in generators {
                    self.w.write_str(" for ")?;
                    self.print_src(&generator.index)?;
                    self.w.write_str(" in ")?;
                    self.print_src(&generator.iter)?;
                }
                self.w.write_str(" ]")?;
            }
            Ast::Function { code, defargs } => {
                // A function that was never stored is a lambda.
                self.w.write_str("lambda ")?;
                self.w.write_char('(')?;
                if let Ast::Object(Value::Code(code_src)) = &**code {
                    let code_src = code_src.clone();
                    self.print_params(&code_src, defargs)?;
                }
                self.w.write_str("): ")?;
                self.print_src(code)?;
            }
            Ast::Class { name, .. } => {
                self.print_src(name)?;
            }
            Ast::Convert(value) => {
                self.w.write_char('`')?;
                self.print_src(value)?;
                self.w.write_char('`')?;
            }
            Ast::Import {
                name,
                stores,
                ..
            } => {
                if !stores.is_empty() {
                    self.w.write_str("from ")?;
                    self.print_import_target(name)?;
                    self.w.write_str(" import ")?;
                    for (i, (src, dest)) in stores.iter().enumerate() {
                        if i > 0 {
                            self.w.write_str(", ")?;
                        }
                        self.print_src(src)?;
                        let renamed = match (src, dest) {
                            (Ast::Name(s), Ast::Name(d)) => s != d,
                            _ => false,
                        };
                        if renamed {
                            self.w.write_str(" as ")?;
                            self.print_src(dest)?;
                        }
                    }
                } else {
                    self.w.write_str("import ")?;
                    self.print_src(name)?;
                }
            }
            Ast::Store { src, dest } => self.print_store(src, dest)?,
            Ast::Delete(value) => {
                self.w.write_str("del ")?;
                self.print_src(value)?;
            }
            Ast::Return { value, kind } => {
                match kind {
                    ReturnKind::Return => self.w.write_str("return ")?,
                    ReturnKind::Yield => self.w.write_str("yield ")?,
                }
                self.print_src(value)?;
            }
            Ast::Raise(params) => {
                self.w.write_str("raise ")?;
                for (i, param) in params.iter().enumerate() {
                    if i > 0 {
                        self.w.write_str(", ")?;
                    }
                    self.print_src(param)?;
                }
            }
            Ast::Print { value, stream } => {
                if value.is_none() {
                    if !self.in_print {
                        self.w.write_str("print ")?;
                        if !stream.is_none() {
                            self.w.write_str(">>")?;
                            self.print_src(stream)?;
                        }
                    }
                    self.in_print = false;
                } else if !self.in_print {
                    self.w.write_str("print ")?;
                    if !stream.is_none() {
                        self.w.write_str(">>")?;
                        self.print_src(stream)?;
                        self.w.write_str(", ")?;
                    }
                    self.print_src(value)?;
                    self.in_print = true;
                } else {
                    self.w.write_str(", ")?;
                    self.print_src(value)?;
                }
            }
            Ast::Exec {
                stmt,
                globals,
                locals,
            } => {
                self.w.write_str("exec ")?;
                self.print_src(stmt)?;
                if !globals.is_none() {
                    self.w.write_str(" in ")?;
                    self.print_src(globals)?;
                    if !locals.is_none() && locals != globals {
                        self.w.write_str(", ")?;
                        self.print_src(locals)?;
                    }
                }
            }
            Ast::Keyword(kind) => self.w.write_str(kind.word_str())?,
            Ast::Block(block) => self.print_block_node(block)?,
            Ast::NodeList(nodes) => {
                self.indent += 1;
                for node in nodes {
                    if !matches!(node, Ast::NodeList(_)) {
                        self.start_line()?;
                    }
                    self.print_src(node)?;
                    self.end_line()?;
                }
                self.indent -= 1;
            }
        }
        Ok(())
    }

    fn print_const(&mut self, value: &Value) -> Result<(), DepycError> {
        match value {
            Value::None => self.w.write_str("None")?,
            Value::True => self.w.write_str("True")?,
            Value::False => self.w.write_str("False")?,
            Value::Ellipsis => self.w.write_str("...")?,
            Value::StopIteration => self.w.write_str("StopIteration")?,
            Value::Int(v) => write!(self.w, "{v}")?,
            Value::Int64(v) => write!(self.w, "{v}")?,
            Value::Long(digits) => {
                self.w.write_str(digits)?;
                if self.version.major < 3 {
                    self.w.write_char('L')?;
                }
            }
            Value::Float(v) => write!(self.w, "{v:?}")?,
            Value::Complex(re, im) => {
                write!(self.w, "({re:?}{}{im:?}j)", if *im < 0.0 { "" } else { "+" })?
            }
            Value::Str(s) => {
                // A byte string is plain `str` before 3.0.
                if self.version.major >= 3 {
                    self.w.write_char('b')?;
                }
                self.print_string_literal(s)?;
            }
            Value::Unicode(s) => {
                if self.version.major < 3 {
                    self.w.write_char('u')?;
                }
                self.print_string_literal(s)?;
            }
            Value::Tuple(values) => {
                self.w.write_char('(')?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        self.w.write_str(", ")?;
                    }
                    self.print_const(v)?;
                }
                if values.len() == 1 {
                    self.w.write_str(",)")?;
                } else {
                    self.w.write_char(')')?;
                }
            }
            Value::List(values) => {
                self.w.write_char('[')?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        self.w.write_str(", ")?;
                    }
                    self.print_const(v)?;
                }
                self.w.write_char(']')?;
            }
            Value::Dict(pairs) => {
                self.w.write_char('{')?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        self.w.write_str(", ")?;
                    }
                    self.print_const(k)?;
                    self.w.write_str(": ")?;
                    self.print_const(v)?;
                }
                self.w.write_char('}')?;
            }
            Value::Code(code) => {
                warn!(name = %code.name, "code constant outside a function context");
                write!(self.w, "<code object {}>", code.name)?;
            }
        }
        Ok(())
    }

    fn print_string_literal(&mut self, s: &str) -> Result<(), DepycError> {
        self.w.write_char('\'')?;
        for ch in s.chars() {
            match ch {
                '\\' => self.w.write_str("\\\\")?,
                '\'' => self.w.write_str("\\'")?,
                '\n' => self.w.write_str("\\n")?,
                '\r' => self.w.write_str("\\r")?,
                '\t' => self.w.write_str("\\t")?,
                c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                    write!(self.w, "\\x{:02x}", c as u32)?
                }
                c => self.w.write_char(c)?,
            }
        }
        self.w.write_char('\'')?;
        Ok(())
    }
}

fn disasm_code<W: Write>(
    w: &mut W,
    code: &Rc<Code>,
    version: Version,
) -> Result<(), DepycError> {
    writeln!(
        w,
        "code {} (args={}, locals={}, stacksize={}, flags=0x{:08x})",
        if code.name.is_empty() { "<module>" } else { &code.name },
        code.arg_count,
        code.num_locals,
        code.stack_size,
        code.flags
    )?;

    let mut cursor = Cursor::new(&code.code, version);
    while !cursor.at_eof() {
        match cursor.next() {
            Ok(instr) => {
                write!(w, "{:05} {:<24}", instr.offset, instr.opcode.name())?;
                if instr.has_arg {
                    write!(w, "{}", instr.operand)?;
                }
                writeln!(w)?;
            }
            Err(e) => {
                writeln!(w, "# {e}")?;
                break;
            }
        }
    }

    for value in &code.consts {
        if let Value::Code(inner) = value {
            writeln!(w)?;
            disasm_code(w, inner, version)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::CmpOp;

    fn name(n: &str) -> Ast {
        Ast::Name(n.to_string())
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let add = Ast::binary(name("a"), name("b"), BinOp::Add);
        let mul = Ast::binary(name("a"), name("b"), BinOp::Multiply);
        assert!(cmp_prec(&add, &mul) < 0);
        assert!(cmp_prec(&mul, &add) > 0);
    }

    #[test]
    fn rank_order_follows_the_language() {
        // For every pair where the parent binds tighter, the child gets
        // parenthesised.
        let ops = [
            BinOp::Power,
            BinOp::Multiply,
            BinOp::Add,
            BinOp::LShift,
            BinOp::And,
            BinOp::Xor,
            BinOp::Or,
            BinOp::LogAnd,
            BinOp::LogOr,
        ];
        for (i, parent_op) in ops.iter().enumerate() {
            for child_op in ops.iter().skip(i + 1) {
                let parent = Ast::binary(name("a"), name("b"), *parent_op);
                let child = Ast::binary(name("a"), name("b"), *child_op);
                assert!(
                    cmp_prec(&parent, &child) > 0,
                    "{parent_op:?} should force parens around {child_op:?}"
                );
            }
        }
    }

    #[test]
    fn not_always_parenthesises_its_operand() {
        let parent = Ast::Unary {
            operand: Box::new(name("a")),
            op: UnaryOp::Not,
        };
        let child = Ast::binary(name("a"), name("b"), BinOp::Add);
        assert!(cmp_prec(&parent, &child) > 0);
    }

    #[test]
    fn comparisons_nest_in_boolean_operators_without_parens() {
        let parent = Ast::binary(name("a"), name("b"), BinOp::LogAnd);
        let child = Ast::Compare {
            left: Box::new(name("a")),
            right: Box::new(name("b")),
            op: CmpOp::Less,
        };
        assert!(cmp_prec(&parent, &child) < 0);
    }
}

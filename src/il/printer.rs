//! Textual disassembly of method bodies.

use super::body::{HandlerKind, MethodBody};
use super::instruction::Operand;
use super::module::{MethodDef, Module};
use std::fmt::{self, Write};

/// Disassemble a body as `IL_0000: op operand` lines followed by its handler table.
pub fn disassemble(body: &MethodBody) -> String {
    let offsets = body.offsets();
    let label = |id| match offsets.get(&id) {
        Some(offset) => format!("IL_{:04x}", offset),
        None => format!("<detached {}>", id),
    };

    let mut out = String::new();
    for (index, ty) in body.variables.iter().enumerate() {
        let _ = writeln!(out, "  .local V_{} {}", index, ty);
    }
    for (id, instr) in body.instructions.iter() {
        let _ = write!(out, "  {}: {}", label(id), instr.op);
        match &instr.operand {
            Operand::None => {}
            Operand::Target(t) => {
                let _ = write!(out, " {}", label(*t));
            }
            Operand::Switch(ts) => {
                let targets: Vec<String> = ts.iter().map(|t| label(*t)).collect();
                let _ = write!(out, " ({})", targets.join(", "));
            }
            other => {
                let _ = write!(out, " {}", other);
            }
        }
        out.push('\n');
    }
    for h in &body.handlers {
        let kind = match &h.kind {
            HandlerKind::Catch(ty) => format!("catch {}", ty),
            HandlerKind::Finally => "finally".to_string(),
            HandlerKind::Fault => "fault".to_string(),
        };
        let end = h.handler_end.map(label).unwrap_or_else(|| "end".to_string());
        let _ = writeln!(
            out,
            "  .try {} to {} {} handler {} to {}",
            label(h.try_start),
            label(h.try_end),
            kind,
            label(h.handler_start),
            end
        );
    }
    out
}

/// Display adapter for a method with its declaring type name.
pub struct MethodListing<'a> {
    pub declaring: &'a str,
    pub method: &'a MethodDef,
}

impl fmt::Display for MethodListing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.method;
        let params: Vec<String> = m.params.iter().map(|p| format!("{} {}", p.ty, p.name)).collect();
        writeln!(
            f,
            ".method {}{}{} {}::{}({})",
            if m.is_private { "private " } else { "public " },
            if m.is_static { "static " } else { "" },
            m.return_type,
            self.declaring,
            m.name,
            params.join(", ")
        )?;
        match &m.body {
            Some(body) => write!(f, "{}", disassemble(body)),
            None => writeln!(f, "  // no body"),
        }
    }
}

/// Disassemble every method with a body, or only `Type::Method` when a filter is given.
pub fn disassemble_module(module: &Module, filter: Option<&str>) -> String {
    let mut out = String::new();
    for ty in &module.types {
        for method in &ty.methods {
            let full = format!("{}::{}", ty.full_name, method.name);
            if filter.map_or(false, |f| f != full) {
                continue;
            }
            let _ = writeln!(out, "{}", MethodListing { declaring: &ty.full_name, method });
        }
    }
    out
}

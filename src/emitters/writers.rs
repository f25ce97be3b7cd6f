//! Textual views of an emitted module: Cranelift IR, C header and SWIG
//! interface.

use std::fmt::Write as _;
use std::io::Write;

use serde::{Deserialize, Serialize};

use super::module::{DataContents, ModuleEmitter};
use crate::error::EmitterResult;

/// Output format of `CompiledMap::write_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleOutputFormat {
    /// Cranelift IR text of every data object and function.
    Ir,
    /// Relocatable object code for the host.
    ObjectCode,
    /// C header declaring structs, callbacks and public functions.
    CHeader,
    /// SWIG interface wrapping the C header.
    SwigInterface,
}

impl ModuleOutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ModuleOutputFormat::Ir => "clif",
            ModuleOutputFormat::ObjectCode => "o",
            ModuleOutputFormat::CHeader => "h",
            ModuleOutputFormat::SwigInterface => "i",
        }
    }
}

/// Writes `module` in `format`.
pub fn write_module<W: Write>(module: &ModuleEmitter, format: ModuleOutputFormat, mut out: W) -> EmitterResult<()> {
    match format {
        ModuleOutputFormat::Ir => out.write_all(ir_text(module).as_bytes())?,
        ModuleOutputFormat::ObjectCode => out.write_all(&module.object_code()?)?,
        ModuleOutputFormat::CHeader => out.write_all(c_header(module).as_bytes())?,
        ModuleOutputFormat::SwigInterface => out.write_all(swig_interface(module).as_bytes())?,
    }
    out.flush()?;
    Ok(())
}

pub fn ir_text(module: &ModuleEmitter) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "; module {}", module.name());
    for (name, writable, definition) in module.data_objects() {
        let kind = if writable { "data" } else { "rodata" };
        match definition {
            Some(definition) => {
                let contents = match &definition.contents {
                    DataContents::Zero(size) => format!("zeroinit {}", size),
                    DataContents::Bytes(bytes) => format!("bytes {:02x?}", bytes),
                };
                let _ = write!(out, "; {} {} align {} {}", kind, name, definition.align, contents);
                for (offset, target, addend) in &definition.data_relocs {
                    let _ = write!(out, " [+{}: &{}{:+}]", offset, module.data_name(*target), addend);
                }
                out.push('\n');
            }
            None => {
                let _ = writeln!(out, "; {} {} (undefined)", kind, name);
            }
        }
    }
    for (decl, body) in module.function_bodies() {
        let _ = writeln!(out, "\n; {}", decl.name);
        let _ = write!(out, "{}", body.display());
    }
    out
}

fn guard_name(module: &ModuleEmitter) -> String {
    module
        .name()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

pub fn c_header(module: &ModuleEmitter) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "//\n// Compiled model '{}'\n//", module.name());
    for comment in module.header_comments() {
        let _ = writeln!(out, "// {}", comment);
    }
    let guard = guard_name(module);
    let _ = writeln!(out, "\n#ifndef {}_H\n#define {}_H\n", guard, guard);
    out.push_str("#include <stdbool.h>\n#include <stdint.h>\n\n");
    out.push_str("#ifdef __cplusplus\nextern \"C\"\n{\n#endif\n\n");

    for decl in module.structs() {
        out.push_str(&decl.c_definition());
        out.push('\n');
    }

    if !module.callbacks().is_empty() {
        out.push_str("// Callbacks the host provides\n");
        for callback in module.callbacks() {
            let _ = writeln!(out, "{};", callback.decl.c_prototype());
        }
        out.push('\n');
    }

    for decl in module.public_functions() {
        let _ = writeln!(out, "{};", decl.c_prototype());
    }

    out.push_str("\n#ifdef __cplusplus\n} // extern \"C\"\n#endif\n");
    let _ = writeln!(out, "\n#endif // {}_H", guard);
    out
}

pub fn swig_interface(module: &ModuleEmitter) -> String {
    let mut out = String::new();
    let name = module.name();
    let _ = writeln!(out, "%module {}\n", name);
    let _ = writeln!(out, "%{{\n#include \"{}.h\"\n%}}\n", name);
    if !module.callbacks().is_empty() {
        out.push_str("// Callbacks forwarded to the host language\n");
        for callback in module.callbacks() {
            let _ = writeln!(out, "%callback(\"%s\") {};", callback.decl.name);
        }
        out.push('\n');
    }
    let _ = writeln!(out, "%include \"{}.h\"", name);
    out
}

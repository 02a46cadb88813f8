//! This is the `tinypy` facade. It bundles the bytecode model and the
//! virtual machine; if you want to plug in your own values you're likely
//! looking for the [`tinypy_vm::ObjectSpace`] trait.
//!
//! ```
//! use tinypy::bytecode::{CodeBuilder, Instruction};
//!
//! let mut builder = CodeBuilder::new("<module>");
//! builder
//!     .load_const("hello")
//!     .emit(Instruction::PrintItem)
//!     .emit(Instruction::PrintNewline)
//!     .load_const(())
//!     .emit(Instruction::ReturnValue);
//! let code = builder.build().unwrap();
//! assert_eq!(tinypy::run(code.into(), Default::default()), 0);
//! ```

#[macro_use]
extern crate log;

use std::{
    io::{self, Write},
    sync::Arc,
};
use tinypy_vm::{Interpreter, Settings, objspace::SimpleSpace};

pub use tinypy_bytecode as bytecode;
pub use tinypy_vm as vm;

/// Run module level code with the reference object space and return an
/// exit code: 0 on success, 1 when an exception escaped.
///
/// Everything the code printed is copied to standard output.
pub fn run(code: Arc<bytecode::CodeObject>, settings: Settings) -> u32 {
    // a host may already have installed a logger
    let _ = env_logger::try_init();
    debug!("running {}", code.obj_name);

    let interp = Interpreter::new(settings);
    interp.run(|space| {
        let result = space.run_code(code, &space.new_scope());
        flush_output(space);
        result.map(drop)
    })
}

fn flush_output(space: &SimpleSpace) {
    let mut stdout = io::stdout().lock();
    let result = stdout
        .write_all(space.take_output().as_bytes())
        .and_then(|()| stdout.flush());
    if let Err(e) = result {
        error!("Error writing output: {e}");
    }
}

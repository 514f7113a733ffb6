//! Turning a workflow into a concrete command line
//!
//! [`ArgumentCompiler`] compiles the Arguments node against runtime values,
//! the template module renders the Entrypoint argument string, and
//! [`InvocationBuilder`] puts both together into a [`CompiledInvocation`].

mod arguments;
mod builder;
mod template;

pub use arguments::{
    ArgumentBuildError, ArgumentCompiler, ArgumentDeclaration, ArgumentOption, ArgumentType,
    CompiledArguments, DroppedArgument, SelectOptions,
};
pub use builder::{
    CompiledInvocation, InvocationBuilder, InvocationError, TrajectoryFrame, RESERVED_ARGUMENT_NAMES,
};
pub use template::{render_arguments, split_arguments, TemplateError};

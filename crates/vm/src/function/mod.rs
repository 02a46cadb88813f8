mod argument;

pub use argument::{
    ArgumentError, BoundArguments, FuncArgs, Quantifier, bind_arguments, match_signature,
};

//! DL-FI Query - the textual query language
//!
//! Selects nodes by path, metadata, tags, type, and relationship
//! traversals. The pipeline: tokenizer -> recursive-descent parser ->
//! planner that lowers each clause to one indexed lookup through the
//! [`QueryIndex`] trait -> set algebra over node uuids. Autocomplete
//! classifies the token under the cursor and draws candidates from the
//! same index.

mod autocomplete;
mod lexer;
mod parser;
mod plan;

pub use autocomplete::{autocomplete, Suggestion, SuggestionKind};
pub use lexer::{tokenize, Token, TokenKind};
pub use parser::{parse, Clause, Expr, Scalar};
pub use plan::{eval, run_query, QueryIndex};

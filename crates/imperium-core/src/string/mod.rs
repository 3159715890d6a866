//! String validation rules and the prefix-tree matcher behind them.

mod requirement;
mod trie;

pub use requirement::{
    Letter, StringRequirement, default_password_requirements, default_username_requirements,
    missing_requirements, parse_word_list, reserved_usernames,
};
pub use trie::{Token, TrieMap};

// Include handlers module directly from handlers.rs
#[path = "handlers.rs"]
pub mod handlers;

// Re-export commonly used handler functions for convenience
pub use handlers::{
    load_urls_from_file, load_urls_from_source, open_database, parse_url_line, resolve_db_path,
};

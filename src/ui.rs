use humansize::{format_size, BINARY};

pub fn info(message: &str) {
    println!("{message}");
}

pub fn warn(message: &str) {
    eprintln!("warning: {message}");
}

pub fn error(message: &str) {
    eprintln!("error: {message}");
}

pub fn size(bytes: u64) -> String {
    format_size(bytes, BINARY)
}

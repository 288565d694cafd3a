//! Static assets compiled into the binary from `res/`.

macro_rules! include_res {
    ($p:expr) => {
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/res", $p))
    };
}

pub const INDEX_HTML: &str = include_res!("/pages/index.html");
pub const API_DOCS: &str = include_res!("/pages/api.md");

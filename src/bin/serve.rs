//! Development server for webcc
//!
//! A minimal static file server. No dependencies beyond tiny_http.
//! Every response carries the cross-origin isolation headers, without
//! which the page cannot create the `SharedArrayBuffer` stdin relies on.
//!
//! Usage: serve [port] [root]

use std::error::Error;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tiny_http::{Header, Response, Server};

const DEFAULT_PORT: u16 = 8080;

const ISOLATION_HEADERS: [(&str, &str); 2] = [
    ("Cross-Origin-Opener-Policy", "same-origin"),
    ("Cross-Origin-Embedder-Policy", "require-corp"),
];

fn main() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let port = args
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let root = PathBuf::from(args.next().unwrap_or_else(|| ".".to_string()));

    let addr = format!("0.0.0.0:{}", port);
    let server = Server::http(&addr).map_err(|e| -> Box<dyn Error> { e })?;

    println!("webcc dev server");
    println!("  http://localhost:{}", port);
    println!("  serving {}", root.display());

    for request in server.incoming_requests() {
        let url_path = request.url().split('?').next().unwrap_or("/").to_string();
        let response = match resolve(&root, &url_path) {
            Some(path) => serve_file(&path)?,
            None => not_found()?,
        };
        if let Err(e) = request.respond(response) {
            eprintln!("[serve] {}: {}", url_path, e);
        }
    }
    Ok(())
}

/// Map a URL path under `root`, refusing anything that climbs out of it
fn resolve(root: &Path, url_path: &str) -> Option<PathBuf> {
    let relative = match url_path.trim_start_matches('/') {
        "" => "index.html",
        path => path,
    };
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(relative))
}

fn header(name: &str, value: &str) -> Result<Header, Box<dyn Error>> {
    Header::from_bytes(name, value).map_err(|_| format!("bad header {}: {}", name, value).into())
}

fn isolated<R: std::io::Read>(mut response: Response<R>) -> Result<Response<R>, Box<dyn Error>> {
    for (name, value) in ISOLATION_HEADERS {
        response = response.with_header(header(name, value)?);
    }
    Ok(response)
}

fn serve_file(path: &Path) -> Result<Response<std::io::Cursor<Vec<u8>>>, Box<dyn Error>> {
    match fs::read(path) {
        Ok(contents) => {
            let response = Response::from_data(contents)
                .with_header(header("Content-Type", mime_type(path))?);
            isolated(response)
        }
        Err(_) => not_found(),
    }
}

fn not_found() -> Result<Response<std::io::Cursor<Vec<u8>>>, Box<dyn Error>> {
    let response = Response::from_string("404 Not Found")
        .with_status_code(404)
        .with_header(header("Content-Type", "text/plain")?);
    isolated(response)
}

fn mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "application/javascript",
        Some("wasm") => "application/wasm",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("tar") => "application/x-tar",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        // toolchain modules ship without an extension
        None => "application/wasm",
        _ => "application/octet-stream",
    }
}

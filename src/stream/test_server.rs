// A small HTTP/1.1 file server for tests. It answers GET and HEAD, honours a
// single `bytes=a-b` or `bytes=a-` range, and closes every connection after
// one response.

use std::{
    collections::{HashMap, HashSet},
    io::{self, BufRead, BufReader, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread,
};

use parking_lot::Mutex;

#[derive(Default)]
struct Files {
    data: HashMap<String, Vec<u8>>,
    failing: HashSet<String>,
    whole: HashSet<String>,
    requests: Vec<String>,
}

pub struct RangeServer {
    addr: SocketAddr,
    files: Arc<Mutex<Files>>,
}

impl RangeServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let files = Arc::new(Mutex::new(Files::default()));
        let shared = files.clone();
        thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(conn) = conn else {
                    break;
                };
                let files = shared.clone();
                thread::spawn(move || {
                    let _ = serve(conn, &files);
                });
            }
        });
        RangeServer { addr, files }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path)
    }

    pub fn put(&self, path: &str, data: Vec<u8>) {
        self.files.lock().data.insert(path.to_owned(), data);
    }

    /// Every request for `path` gets a 500.
    pub fn fail(&self, path: &str) {
        self.files.lock().failing.insert(path.to_owned());
    }

    /// Requests for `path` get the whole body with a 200, ranges or not.
    pub fn ignore_ranges(&self, path: &str) {
        self.files.lock().whole.insert(path.to_owned());
    }

    /// `METHOD /path range` for every request so far, e.g.
    /// `GET /a.gz bytes=0-99`.
    pub fn take_requests(&self) -> Vec<String> {
        std::mem::take(&mut self.files.lock().requests)
    }
}

struct Reply {
    status: &'static str,
    headers: Vec<String>,
    body: Vec<u8>,
}

impl Reply {
    fn empty(status: &'static str) -> Self {
        Reply {
            status,
            headers: vec!["Content-Length: 0".to_owned()],
            body: Vec::new(),
        }
    }
}

fn serve(conn: TcpStream, files: &Mutex<Files>) -> io::Result<()> {
    let mut reader = BufReader::new(conn.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("GET").to_owned();
    let path = parts.next().unwrap_or("/").trim_start_matches('/').to_owned();

    let mut range = None;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 {
            break;
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.eq_ignore_ascii_case("range") {
                range = Some(value.trim().to_owned());
            }
        }
    }

    let reply = respond(files, &method, &path, range.as_deref());
    let mut out = conn;
    write!(out, "HTTP/1.1 {}\r\n", reply.status)?;
    for header in &reply.headers {
        write!(out, "{}\r\n", header)?;
    }
    write!(out, "Connection: close\r\n\r\n")?;
    if method != "HEAD" {
        out.write_all(&reply.body)?;
    }
    out.flush()
}

fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
    let (first, last) = value.strip_prefix("bytes=")?.split_once('-')?;
    let first: u64 = first.parse().ok()?;
    let last = match last {
        "" => len.saturating_sub(1),
        last => last.parse::<u64>().ok()?.min(len.saturating_sub(1)),
    };
    Some((first, last))
}

fn respond(files: &Mutex<Files>, method: &str, path: &str, range: Option<&str>) -> Reply {
    let mut files = files.lock();
    files
        .requests
        .push(format!("{} /{} {}", method, path, range.unwrap_or("-")));
    if files.failing.contains(path) {
        return Reply::empty("500 Internal Server Error");
    }
    let Some(data) = files.data.get(path) else {
        return Reply::empty("404 Not Found");
    };
    let len = data.len() as u64;
    let whole = Reply {
        status: "200 OK",
        headers: vec![format!("Content-Length: {}", len)],
        body: data.clone(),
    };
    if method == "HEAD" || files.whole.contains(path) {
        return whole;
    }
    let Some(range) = range else {
        return whole;
    };
    match parse_range(range, len) {
        Some((first, _)) if first >= len => Reply {
            status: "416 Range Not Satisfiable",
            headers: vec![
                format!("Content-Range: bytes */{}", len),
                "Content-Length: 0".to_owned(),
            ],
            body: Vec::new(),
        },
        Some((first, last)) => {
            let body = data[first as usize..=last as usize].to_vec();
            Reply {
                status: "206 Partial Content",
                headers: vec![
                    format!("Content-Range: bytes {}-{}/{}", first, last, len),
                    format!("Content-Length: {}", body.len()),
                ],
                body,
            }
        }
        None => whole,
    }
}

//! In-process RESP2 backend for integration tests.
//!
//! Speaks enough of the protocol for the client's helpers and the lock:
//! strings, hashes, counters, TTLs, AUTH/SELECT, EVAL/EVALSHA of the unlock
//! script. Every command runs under one store mutex, so SET NX and the
//! compare-and-delete script are atomic just like on a real server.
//!
//! Two test-only commands exist: `DEBUG SLEEP <secs>` (delays the reply) and
//! `DEBUG CLOSE` (drops the connection without replying).

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kvx_client::{Executor, UNLOCK_SCRIPT_SOURCE};
use kvx_common::{Profile, ProfileFields};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};

enum Value {
    Str(Vec<u8>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Store {
    dbs: HashMap<u32, HashMap<Vec<u8>, Entry>>,
    scripts: HashMap<String, String>,
}

impl Store {
    fn db(&mut self, index: u32) -> &mut HashMap<Vec<u8>, Entry> {
        let db = self.dbs.entry(index).or_default();
        let now = Instant::now();
        db.retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        db
    }
}

struct Shared {
    store: Mutex<Store>,
    password: Option<String>,
    log: Mutex<Vec<Vec<Vec<u8>>>>,
    accepted: AtomicUsize,
    live: AtomicUsize,
    peak: AtomicUsize,
}

/// Handle to a running fake backend. The server lives for the whole test
/// process; each test starts its own on an ephemeral port.
#[derive(Clone)]
pub struct FakeBackend {
    port: u16,
    shared: Arc<Shared>,
}

impl FakeBackend {
    pub fn start() -> Self {
        Self::spawn(None)
    }

    pub fn start_with_password(password: &str) -> Self {
        Self::spawn(Some(password.to_string()))
    }

    fn spawn(password: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let shared = Arc::new(Shared {
            store: Mutex::new(Store::default()),
            password,
            log: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let server = shared.clone();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                server.accepted.fetch_add(1, Ordering::SeqCst);
                let live = server.live.fetch_add(1, Ordering::SeqCst) + 1;
                server.peak.fetch_max(live, Ordering::SeqCst);
                let session = server.clone();
                thread::spawn(move || {
                    serve(stream, &session);
                    session.live.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        FakeBackend { port, shared }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Profile pointing at this backend with short timeouts.
    pub fn profile(&self, tweak: impl FnOnce(&mut ProfileFields)) -> Profile {
        let mut fields = ProfileFields {
            host: "127.0.0.1".to_string(),
            port: i64::from(self.port),
            connect_timeout: 1_000,
            read_timeout: 2_000,
            write_timeout: 2_000,
            max_active: 4,
            max_idle: 4,
            ..ProfileFields::default()
        };
        tweak(&mut fields);
        Profile::from_fields(fields).expect("profile")
    }

    pub fn executor(&self) -> Executor {
        Executor::new(self.profile(|_| {}))
    }

    /// Value stored under `key` in database 0, bypassing the protocol.
    pub fn raw_get(&self, key: &str) -> Option<Vec<u8>> {
        let mut store = self.shared.store.lock();
        match store.db(0).get(key.as_bytes()) {
            Some(Entry {
                value: Value::Str(data),
                ..
            }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn raw_get_in(&self, db: u32, key: &str) -> Option<Vec<u8>> {
        let mut store = self.shared.store.lock();
        match store.db(db).get(key.as_bytes()) {
            Some(Entry {
                value: Value::Str(data),
                ..
            }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Simulates the TTL firing for `key`.
    pub fn expire_now(&self, key: &str) {
        let mut store = self.shared.store.lock();
        store.db(0).remove(key.as_bytes());
    }

    /// Upper-cased names of every command received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.shared
            .log
            .lock()
            .iter()
            .map(|args| String::from_utf8_lossy(&args[0]).to_uppercase())
            .collect()
    }

    /// Full argument vectors of every command received, in order.
    pub fn command_log(&self) -> Vec<Vec<Vec<u8>>> {
        self.shared.log.lock().clone()
    }

    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub fn peak_connections(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }
}

struct Session {
    authed: bool,
    db: u32,
}

fn serve(stream: TcpStream, shared: &Shared) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    let mut session = Session {
        authed: shared.password.is_none(),
        db: 0,
    };

    while let Ok(Some(args)) = read_command(&mut reader) {
        if args.is_empty() {
            return;
        }
        shared.log.lock().push(args.clone());

        let reply = match handle(&args, shared, &mut session) {
            Some(reply) => reply,
            None => return,
        };
        if writer.write_all(&reply).and_then(|_| writer.flush()).is_err() {
            return;
        }
    }
}

/// Returns `None` when the connection must be dropped without a reply.
fn handle(args: &[Vec<u8>], shared: &Shared, session: &mut Session) -> Option<Vec<u8>> {
    let name = String::from_utf8_lossy(&args[0]).to_uppercase();
    let rest = &args[1..];

    if name == "AUTH" {
        return Some(match (&shared.password, rest) {
            (Some(expected), [given]) if expected.as_bytes() == given.as_slice() => {
                session.authed = true;
                simple("OK")
            }
            (Some(_), [_]) => error("WRONGPASS invalid username-password pair"),
            (None, _) => error("ERR AUTH called without any password configured"),
            _ => arity(&name),
        });
    }
    if !session.authed {
        return Some(error("NOAUTH Authentication required."));
    }

    match name.as_str() {
        "PING" => return Some(simple("PONG")),
        "SELECT" => {
            return Some(match rest.first().and_then(|db| parse::<u32>(db)) {
                Some(db) => {
                    session.db = db;
                    simple("OK")
                }
                None => error("ERR invalid DB index"),
            })
        }
        "DEBUG" => {
            let sub = rest
                .first()
                .map(|s| String::from_utf8_lossy(s).to_uppercase())
                .unwrap_or_default();
            return match sub.as_str() {
                "CLOSE" => None,
                "SLEEP" => {
                    let secs = rest.get(1).and_then(|s| parse::<f64>(s)).unwrap_or(0.0);
                    thread::sleep(Duration::from_secs_f64(secs));
                    Some(simple("OK"))
                }
                _ => Some(error("ERR unknown DEBUG subcommand")),
            };
        }
        _ => {}
    }

    let mut store = shared.store.lock();
    Some(run(&name, rest, &mut store, session.db))
}

fn run(name: &str, args: &[Vec<u8>], store: &mut Store, db_index: u32) -> Vec<u8> {
    match name {
        "EVAL" | "EVALSHA" => return eval(name, args, store, db_index),
        _ => {}
    }

    let db = store.db(db_index);
    match (name, args) {
        ("GET", [key]) => match db.get(key) {
            None => nil(),
            Some(Entry {
                value: Value::Str(data),
                ..
            }) => bulk(data),
            Some(_) => wrongtype(),
        },
        ("SET", [key, value, options @ ..]) => set(db, key, value, options),
        ("SETEX", [key, secs, value]) => match parse::<u64>(secs) {
            Some(secs) if secs > 0 => {
                db.insert(
                    key.clone(),
                    Entry {
                        value: Value::Str(value.clone()),
                        expires_at: Some(Instant::now() + Duration::from_secs(secs)),
                    },
                );
                simple("OK")
            }
            _ => error("ERR invalid expire time in 'setex' command"),
        },
        ("DEL", keys) if !keys.is_empty() => {
            integer(keys.iter().filter(|key| db.remove(*key).is_some()).count() as i64)
        }
        ("EXISTS", keys) if !keys.is_empty() => {
            integer(keys.iter().filter(|key| db.contains_key(*key)).count() as i64)
        }
        ("TTL", [key]) => match db.get(key) {
            None => integer(-2),
            Some(Entry {
                expires_at: None, ..
            }) => integer(-1),
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => {
                let remaining = at.saturating_duration_since(Instant::now());
                integer(((remaining.as_millis() + 500) / 1000) as i64)
            }
        },
        ("MGET", keys) if !keys.is_empty() => array(
            keys.iter()
                .map(|key| match db.get(key) {
                    Some(Entry {
                        value: Value::Str(data),
                        ..
                    }) => bulk(data),
                    _ => nil(),
                })
                .collect(),
        ),
        ("MSET", pairs) if !pairs.is_empty() && pairs.len() % 2 == 0 => {
            for pair in pairs.chunks(2) {
                db.insert(
                    pair[0].clone(),
                    Entry {
                        value: Value::Str(pair[1].clone()),
                        expires_at: None,
                    },
                );
            }
            simple("OK")
        }
        ("INCR", [key]) => incr_by(db, key, 1),
        ("DECR", [key]) => incr_by(db, key, -1),
        ("INCRBY", [key, by]) => match parse::<i64>(by) {
            Some(by) => incr_by(db, key, by),
            None => not_integer(),
        },
        ("DECRBY", [key, by]) => match parse::<i64>(by) {
            Some(by) => incr_by(db, key, -by),
            None => not_integer(),
        },
        ("INCRBYFLOAT", [key, by]) => match parse::<f64>(by) {
            Some(by) => incr_by_float(db, key, by),
            None => error("ERR value is not a valid float"),
        },
        ("HGET", [key, field]) => match hash(db, key, false) {
            Ok(Some(hash)) => hash.get(field).map_or_else(nil, |v| bulk(v)),
            Ok(None) => nil(),
            Err(reply) => reply,
        },
        ("HSET", [key, pairs @ ..]) | ("HMSET", [key, pairs @ ..])
            if !pairs.is_empty() && pairs.len() % 2 == 0 =>
        {
            match hash(db, key, true) {
                Ok(Some(hash)) => {
                    let mut added = 0;
                    for pair in pairs.chunks(2) {
                        if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
                            added += 1;
                        }
                    }
                    if name == "HMSET" {
                        simple("OK")
                    } else {
                        integer(added)
                    }
                }
                Ok(None) => unreachable!("hash created on demand"),
                Err(reply) => reply,
            }
        }
        ("HDEL", [key, fields @ ..]) if !fields.is_empty() => match hash(db, key, false) {
            Ok(Some(hash)) => {
                let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count();
                integer(removed as i64)
            }
            Ok(None) => integer(0),
            Err(reply) => reply,
        },
        ("HEXISTS", [key, field]) => match hash(db, key, false) {
            Ok(Some(hash)) => integer(i64::from(hash.contains_key(field))),
            Ok(None) => integer(0),
            Err(reply) => reply,
        },
        ("HMGET", [key, fields @ ..]) if !fields.is_empty() => match hash(db, key, false) {
            Ok(hash) => array(
                fields
                    .iter()
                    .map(|f| {
                        hash.as_ref()
                            .and_then(|h| h.get(f))
                            .map_or_else(nil, |v| bulk(v))
                    })
                    .collect(),
            ),
            Err(reply) => reply,
        },
        ("HGETALL", [key]) => match hash(db, key, false) {
            Ok(hash) => array(
                hash.as_deref()
                    .into_iter()
                    .flat_map(|h| h.iter())
                    .flat_map(|(f, v)| [bulk(f), bulk(v)])
                    .collect(),
            ),
            Err(reply) => reply,
        },
        ("HKEYS", [key]) => match hash(db, key, false) {
            Ok(hash) => array(
                hash.as_deref()
                    .into_iter()
                    .flat_map(|h| h.keys())
                    .map(|f| bulk(f))
                    .collect(),
            ),
            Err(reply) => reply,
        },
        ("HVALS", [key]) => match hash(db, key, false) {
            Ok(hash) => array(
                hash.as_deref()
                    .into_iter()
                    .flat_map(|h| h.values())
                    .map(|v| bulk(v))
                    .collect(),
            ),
            Err(reply) => reply,
        },
        ("HINCRBY", [key, field, by]) => match (parse::<i64>(by), hash(db, key, true)) {
            (Some(by), Ok(Some(hash))) => {
                let current = match hash.get(field) {
                    Some(raw) => match parse::<i64>(raw) {
                        Some(n) => n,
                        None => return error("ERR hash value is not an integer"),
                    },
                    None => 0,
                };
                let next = current + by;
                hash.insert(field.clone(), next.to_string().into_bytes());
                integer(next)
            }
            (None, _) => not_integer(),
            (_, Err(reply)) => reply,
            (_, Ok(None)) => unreachable!("hash created on demand"),
        },
        ("HINCRBYFLOAT", [key, field, by]) => match (parse::<f64>(by), hash(db, key, true)) {
            (Some(by), Ok(Some(hash))) => {
                let current = match hash.get(field) {
                    Some(raw) => match parse::<f64>(raw) {
                        Some(n) => n,
                        None => return error("ERR hash value is not a float"),
                    },
                    None => 0.0,
                };
                let next = (current + by).to_string().into_bytes();
                hash.insert(field.clone(), next.clone());
                bulk(&next)
            }
            (None, _) => error("ERR value is not a valid float"),
            (_, Err(reply)) => reply,
            (_, Ok(None)) => unreachable!("hash created on demand"),
        },
        _ => error(&format!("ERR unknown command or wrong number of arguments for '{name}'")),
    }
}

fn set(db: &mut HashMap<Vec<u8>, Entry>, key: &[u8], value: &[u8], options: &[Vec<u8>]) -> Vec<u8> {
    let mut ttl = None;
    let mut nx = false;
    let mut xx = false;
    let mut iter = options.iter();
    while let Some(option) = iter.next() {
        match String::from_utf8_lossy(option).to_uppercase().as_str() {
            "NX" => nx = true,
            "XX" => xx = true,
            unit @ ("EX" | "PX") => {
                let amount = match iter.next().and_then(|raw| parse::<u64>(raw)) {
                    Some(amount) if amount > 0 => amount,
                    _ => return error("ERR invalid expire time in 'set' command"),
                };
                ttl = Some(if unit == "EX" {
                    Duration::from_secs(amount)
                } else {
                    Duration::from_millis(amount)
                });
            }
            _ => return error("ERR syntax error"),
        }
    }

    let exists = db.contains_key(key);
    if (nx && exists) || (xx && !exists) {
        return nil();
    }
    db.insert(
        key.to_vec(),
        Entry {
            value: Value::Str(value.to_vec()),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        },
    );
    simple("OK")
}

fn eval(name: &str, args: &[Vec<u8>], store: &mut Store, db_index: u32) -> Vec<u8> {
    let [script, numkeys, rest @ ..] = args else {
        return error("ERR wrong number of arguments");
    };
    let source = if name == "EVAL" {
        let source = String::from_utf8_lossy(script).into_owned();
        store.scripts.insert(hex::encode(Sha1::digest(source.as_bytes())), source.clone());
        source
    } else {
        match store.scripts.get(&*String::from_utf8_lossy(script)) {
            Some(source) => source.clone(),
            None => return error("NOSCRIPT No matching script. Please use EVAL."),
        }
    };

    let numkeys = match parse::<usize>(numkeys) {
        Some(n) if n <= rest.len() => n,
        _ => return error("ERR Number of keys can't be greater than number of args"),
    };
    let (keys, argv) = rest.split_at(numkeys);

    if source != UNLOCK_SCRIPT_SOURCE {
        return error("ERR unsupported script");
    }
    let (Some(key), Some(token)) = (keys.first(), argv.first()) else {
        return error("ERR unlock script needs one key and one argument");
    };
    let db = store.db(db_index);
    let owned = matches!(db.get(key), Some(Entry { value: Value::Str(data), .. }) if data == token);
    if owned {
        db.remove(key);
        integer(1)
    } else {
        integer(0)
    }
}

fn hash<'a>(
    db: &'a mut HashMap<Vec<u8>, Entry>,
    key: &[u8],
    create: bool,
) -> Result<Option<&'a mut BTreeMap<Vec<u8>, Vec<u8>>>, Vec<u8>> {
    if create && !db.contains_key(key) {
        db.insert(
            key.to_vec(),
            Entry {
                value: Value::Hash(BTreeMap::new()),
                expires_at: None,
            },
        );
    }
    match db.get_mut(key) {
        None => Ok(None),
        Some(Entry {
            value: Value::Hash(hash),
            ..
        }) => Ok(Some(hash)),
        Some(_) => Err(wrongtype()),
    }
}

fn incr_by(db: &mut HashMap<Vec<u8>, Entry>, key: &[u8], by: i64) -> Vec<u8> {
    let current = match db.get(key) {
        None => 0,
        Some(Entry {
            value: Value::Str(raw),
            ..
        }) => match parse::<i64>(raw) {
            Some(n) => n,
            None => return not_integer(),
        },
        Some(_) => return wrongtype(),
    };
    let next = current + by;
    let expires_at = db.get(key).and_then(|entry| entry.expires_at);
    db.insert(
        key.to_vec(),
        Entry {
            value: Value::Str(next.to_string().into_bytes()),
            expires_at,
        },
    );
    integer(next)
}

fn incr_by_float(db: &mut HashMap<Vec<u8>, Entry>, key: &[u8], by: f64) -> Vec<u8> {
    let current = match db.get(key) {
        None => 0.0,
        Some(Entry {
            value: Value::Str(raw),
            ..
        }) => match parse::<f64>(raw) {
            Some(n) => n,
            None => return error("ERR value is not a valid float"),
        },
        Some(_) => return wrongtype(),
    };
    let next = (current + by).to_string().into_bytes();
    let expires_at = db.get(key).and_then(|entry| entry.expires_at);
    db.insert(
        key.to_vec(),
        Entry {
            value: Value::Str(next.clone()),
            expires_at,
        },
    );
    bulk(&next)
}

fn parse<T: std::str::FromStr>(raw: &[u8]) -> Option<T> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

fn simple(text: &str) -> Vec<u8> {
    format!("+{text}\r\n").into_bytes()
}

fn error(text: &str) -> Vec<u8> {
    format!("-{text}\r\n").into_bytes()
}

fn arity(name: &str) -> Vec<u8> {
    error(&format!("ERR wrong number of arguments for '{}' command", name.to_lowercase()))
}

fn wrongtype() -> Vec<u8> {
    error("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn not_integer() -> Vec<u8> {
    error("ERR value is not an integer or out of range")
}

fn integer(value: i64) -> Vec<u8> {
    format!(":{value}\r\n").into_bytes()
}

fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn nil() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

fn array(items: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend_from_slice(&item);
    }
    out
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Option<Vec<Vec<u8>>>> {
    let mut line = Vec::new();
    if !read_line(reader, &mut line)? {
        return Ok(None);
    }
    if line.first() != Some(&b'*') {
        return Err(invalid("expected array"));
    }
    let count: usize = parse(&line[1..]).ok_or_else(|| invalid("bad array length"))?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        if !read_line(reader, &mut line)? {
            return Ok(None);
        }
        if line.first() != Some(&b'$') {
            return Err(invalid("expected bulk"));
        }
        let len: usize = parse(&line[1..]).ok_or_else(|| invalid("bad bulk length"))?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data)?;
        if !data.ends_with(b"\r\n") {
            return Err(invalid("missing crlf"));
        }
        data.truncate(len);
        args.push(data);
    }
    Ok(Some(args))
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<bool> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Ok(false);
    }
    if !buf.ends_with(b"\r\n") {
        return Err(invalid("invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(true)
}

fn invalid(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string())
}

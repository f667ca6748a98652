//! Command key-spec table.
//!
//! Maps a command name to its group and to the positions of its key
//! arguments. Commands with subcommands (`XGROUP CREATE`, `SCRIPT LOAD`, ...)
//! are named `XGROUP-CREATE`, `SCRIPT-LOAD`.
//!
//! Only the key layout matters here; arity and flags are the target's
//! business. Unknown commands get the `UNKNOWN` group and no keys, so a
//! cluster writer broadcasts them.

use bytes::Bytes;

pub mod group {
    pub const GENERIC: &str = "GENERIC";
    pub const STRING: &str = "STRING";
    pub const LIST: &str = "LIST";
    pub const SET: &str = "SET";
    pub const SORTED_SET: &str = "SORTED_SET";
    pub const HASH: &str = "HASH";
    pub const STREAM: &str = "STREAM";
    pub const GEO: &str = "GEO";
    pub const HYPERLOGLOG: &str = "HYPERLOGLOG";
    pub const BITMAP: &str = "BITMAP";
    pub const SCRIPTING: &str = "SCRIPTING";
    pub const SERVER: &str = "SERVER";
    pub const CONNECTION: &str = "CONNECTION";
    pub const TRANSACTIONS: &str = "TRANSACTIONS";
    pub const PUBSUB: &str = "PUBSUB";
    pub const BLOOM: &str = "BLOOM";
    pub const UNKNOWN: &str = "UNKNOWN";
}

/// Where a command keeps its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    /// Every `step`-th argument from `first` to `last`; a negative `last`
    /// counts back from the end (-1 is the final argument).
    Range { first: usize, last: isize, step: usize },
    /// The argument at `numkeys` holds a key count; keys start `first`
    /// arguments after it.
    Keynum { numkeys: usize, first: usize, step: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    pub group: &'static str,
    pub keys: &'static [KeySpec],
}

const NONE: &[KeySpec] = &[];
const FIRST: &[KeySpec] = &[KeySpec::Range {
    first: 1,
    last: 1,
    step: 1,
}];
const SECOND: &[KeySpec] = &[KeySpec::Range {
    first: 2,
    last: 2,
    step: 1,
}];
const FIRST_TWO: &[KeySpec] = &[KeySpec::Range {
    first: 1,
    last: 2,
    step: 1,
}];
const ALL: &[KeySpec] = &[KeySpec::Range {
    first: 1,
    last: -1,
    step: 1,
}];
const ALL_BUT_TIMEOUT: &[KeySpec] = &[KeySpec::Range {
    first: 1,
    last: -2,
    step: 1,
}];
const PAIRS: &[KeySpec] = &[KeySpec::Range {
    first: 1,
    last: -1,
    step: 2,
}];
const FROM_SECOND: &[KeySpec] = &[KeySpec::Range {
    first: 2,
    last: -1,
    step: 1,
}];
const NUMKEYS_AT_1: &[KeySpec] = &[KeySpec::Keynum {
    numkeys: 1,
    first: 1,
    step: 1,
}];
const NUMKEYS_AT_2: &[KeySpec] = &[KeySpec::Keynum {
    numkeys: 2,
    first: 1,
    step: 1,
}];
const DEST_AND_NUMKEYS: &[KeySpec] = &[
    KeySpec::Range {
        first: 1,
        last: 1,
        step: 1,
    },
    KeySpec::Keynum {
        numkeys: 2,
        first: 1,
        step: 1,
    },
];

/// Commands whose second argument selects a subcommand.
fn is_container(name: &str) -> bool {
    matches!(
        name,
        "XGROUP"
            | "XINFO"
            | "SCRIPT"
            | "FUNCTION"
            | "CONFIG"
            | "CLUSTER"
            | "OBJECT"
            | "MEMORY"
            | "CLIENT"
            | "ACL"
            | "COMMAND"
            | "MODULE"
            | "PUBSUB"
            | "SLOWLOG"
            | "LATENCY"
    )
}

/// Looks up an upper-case command name.
pub fn command_info(name: &str) -> Option<CommandInfo> {
    use group::*;

    let (group, keys) = match name {
        // String
        "SET" | "SETNX" | "SETEX" | "PSETEX" | "GET" | "GETSET" | "GETDEL" | "GETEX"
        | "APPEND" | "STRLEN" | "INCR" | "DECR" | "INCRBY" | "DECRBY" | "INCRBYFLOAT"
        | "SETRANGE" | "GETRANGE" | "SUBSTR" => (STRING, FIRST),
        "MSET" | "MSETNX" => (STRING, PAIRS),
        "MGET" => (STRING, ALL),
        "LCS" => (STRING, FIRST_TWO),

        // Generic
        "DEL" | "UNLINK" | "EXISTS" | "TOUCH" => (GENERIC, ALL),
        "EXPIRE" | "PEXPIRE" | "EXPIREAT" | "PEXPIREAT" | "PERSIST" | "TTL" | "PTTL"
        | "TYPE" | "MOVE" | "RESTORE" | "DUMP" | "SORT" | "SORT_RO" => (GENERIC, FIRST),
        "RENAME" | "RENAMENX" | "COPY" => (GENERIC, FIRST_TWO),
        "OBJECT-ENCODING" | "OBJECT-FREQ" | "OBJECT-IDLETIME" | "OBJECT-REFCOUNT" => {
            (GENERIC, SECOND)
        }

        // List
        "LPUSH" | "RPUSH" | "LPUSHX" | "RPUSHX" | "LPOP" | "RPOP" | "LINSERT" | "LSET"
        | "LREM" | "LTRIM" | "LRANGE" | "LLEN" | "LINDEX" | "LPOS" => (LIST, FIRST),
        "RPOPLPUSH" | "LMOVE" | "BRPOPLPUSH" | "BLMOVE" => (LIST, FIRST_TWO),
        "BLPOP" | "BRPOP" => (LIST, ALL_BUT_TIMEOUT),
        "LMPOP" => (LIST, NUMKEYS_AT_1),
        "BLMPOP" => (LIST, NUMKEYS_AT_2),

        // Hash
        "HSET" | "HSETNX" | "HMSET" | "HDEL" | "HINCRBY" | "HINCRBYFLOAT" | "HGET"
        | "HMGET" | "HGETALL" | "HLEN" | "HEXISTS" | "HKEYS" | "HVALS" | "HSTRLEN" => {
            (HASH, FIRST)
        }
        // Field expiry (7.4+)
        "HEXPIRE" | "HPEXPIRE" | "HEXPIREAT" | "HPEXPIREAT" | "HPERSIST" | "HTTL" | "HPTTL"
        | "HEXPIRETIME" | "HPEXPIRETIME" | "HSETEX" | "HGETEX" | "HGETDEL" => (HASH, FIRST),

        // Set
        "SADD" | "SREM" | "SPOP" | "SMEMBERS" | "SCARD" | "SISMEMBER" | "SMISMEMBER"
        | "SRANDMEMBER" => (SET, FIRST),
        "SMOVE" => (SET, FIRST_TWO),
        "SINTERSTORE" | "SUNIONSTORE" | "SDIFFSTORE" | "SINTER" | "SUNION" | "SDIFF" => {
            (SET, ALL)
        }
        "SINTERCARD" => (SET, NUMKEYS_AT_1),

        // Sorted set
        "ZADD" | "ZINCRBY" | "ZREM" | "ZREMRANGEBYSCORE" | "ZREMRANGEBYRANK"
        | "ZREMRANGEBYLEX" | "ZPOPMIN" | "ZPOPMAX" | "ZRANGE" | "ZCARD" | "ZSCORE"
        | "ZRANK" | "ZCOUNT" => (SORTED_SET, FIRST),
        "ZUNIONSTORE" | "ZINTERSTORE" | "ZDIFFSTORE" => (SORTED_SET, DEST_AND_NUMKEYS),
        "ZRANGESTORE" => (SORTED_SET, FIRST_TWO),
        "BZPOPMIN" | "BZPOPMAX" => (SORTED_SET, ALL_BUT_TIMEOUT),
        "ZMPOP" | "ZINTERCARD" => (SORTED_SET, NUMKEYS_AT_1),
        "BZMPOP" => (SORTED_SET, NUMKEYS_AT_2),

        // Stream
        "XADD" | "XTRIM" | "XDEL" | "XSETID" | "XACK" | "XCLAIM" | "XAUTOCLAIM" | "XLEN"
        | "XRANGE" | "XREVRANGE" | "XPENDING" => (STREAM, FIRST),
        "XGROUP-CREATE" | "XGROUP-SETID" | "XGROUP-DESTROY" | "XGROUP-CREATECONSUMER"
        | "XGROUP-DELCONSUMER" => (STREAM, SECOND),

        // Geo, HyperLogLog, bitmap
        "GEOADD" | "GEODIST" | "GEOHASH" | "GEOPOS" | "GEORADIUS" | "GEORADIUSBYMEMBER"
        | "GEOSEARCH" => (GEO, FIRST),
        "GEOSEARCHSTORE" => (GEO, FIRST_TWO),
        "PFADD" => (HYPERLOGLOG, FIRST),
        "PFMERGE" | "PFCOUNT" => (HYPERLOGLOG, ALL),
        "SETBIT" | "GETBIT" | "BITCOUNT" | "BITPOS" | "BITFIELD" | "BITFIELD_RO" => {
            (BITMAP, FIRST)
        }
        "BITOP" => (BITMAP, FROM_SECOND),

        // Scripting
        "EVAL" | "EVALSHA" | "EVAL_RO" | "EVALSHA_RO" | "FCALL" | "FCALL_RO" => {
            (SCRIPTING, NUMKEYS_AT_2)
        }
        "SCRIPT-LOAD" | "SCRIPT-FLUSH" | "SCRIPT-EXISTS" | "FUNCTION-LOAD"
        | "FUNCTION-DELETE" | "FUNCTION-FLUSH" | "FUNCTION-RESTORE" => (SCRIPTING, NONE),

        // Server, connection, transactions, pub/sub
        "FLUSHDB" | "FLUSHALL" | "SWAPDB" | "DBSIZE" | "INFO" | "TIME" | "REPLCONF" => {
            (SERVER, NONE)
        }
        "SELECT" | "PING" | "ECHO" | "AUTH" | "HELLO" => (CONNECTION, NONE),
        "MULTI" | "EXEC" | "DISCARD" => (TRANSACTIONS, NONE),
        "WATCH" => (TRANSACTIONS, ALL),
        "PUBLISH" | "SPUBLISH" => (PUBSUB, NONE),

        // RedisBloom
        "BF.ADD" | "BF.MADD" | "BF.RESERVE" | "BF.INSERT" | "BF.LOADCHUNK" | "BF.EXISTS" => {
            (BLOOM, FIRST)
        }

        _ => return None,
    };
    Some(CommandInfo { group, keys })
}

/// Resolves the command name of an argument vector, folding subcommands in.
pub fn command_name(argv: &[Bytes]) -> String {
    let Some(first) = argv.first() else {
        return String::new();
    };
    let name = String::from_utf8_lossy(first).to_uppercase();
    if is_container(&name) {
        if let Some(sub) = argv.get(1) {
            return format!("{}-{}", name, String::from_utf8_lossy(sub).to_uppercase());
        }
    }
    name
}

/// Positions of the key arguments of `argv` according to `specs`.
pub fn key_indexes(argv: &[Bytes], specs: &[KeySpec]) -> Vec<usize> {
    let mut out = Vec::new();
    let len = argv.len();
    for spec in specs {
        match *spec {
            KeySpec::Range { first, last, step } => {
                let last = if last < 0 {
                    len as isize + last
                } else {
                    last.min(len as isize - 1)
                };
                let mut i = first as isize;
                while i <= last {
                    out.push(i as usize);
                    i += step.max(1) as isize;
                }
            }
            KeySpec::Keynum {
                numkeys,
                first,
                step,
            } => {
                let count = argv
                    .get(numkeys)
                    .and_then(|b| std::str::from_utf8(b).ok())
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(0);
                let start = numkeys + first;
                for k in 0..count {
                    let i = start + k * step.max(1);
                    if i >= len {
                        break;
                    }
                    out.push(i);
                }
            }
        }
    }
    out
}

/// Name, group and key positions for one command.
pub fn calc_keys(argv: &[Bytes]) -> (String, &'static str, Vec<usize>) {
    let name = command_name(argv);
    match command_info(&name) {
        Some(info) => {
            let idx = key_indexes(argv, info.keys);
            (name, info.group, idx)
        }
        None => (name, group::UNKNOWN, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<Bytes> {
        args.iter().map(|a| Bytes::from(a.to_string())).collect()
    }

    fn keys(args: &[&str]) -> (String, &'static str, Vec<String>) {
        let v = argv(args);
        let (name, group, idx) = calc_keys(&v);
        let ks = idx.iter().map(|&i| args[i].to_string()).collect();
        (name, group, ks)
    }

    #[test]
    fn test_set() {
        assert_eq!(
            keys(&["set", "key", "value"]),
            ("SET".into(), group::STRING, vec!["key".into()])
        );
    }

    #[test]
    fn test_mset_pairs() {
        assert_eq!(
            keys(&["MSET", "key1", "value1", "key2", "value2"]).2,
            vec!["key1", "key2"]
        );
    }

    #[test]
    fn test_xadd() {
        let (name, group, ks) = keys(&["XADD", "key", "*", "field1", "value1"]);
        assert_eq!(name, "XADD");
        assert_eq!(group, group::STREAM);
        assert_eq!(ks, vec!["key"]);
    }

    #[test]
    fn test_zunionstore_keynum() {
        let (_, group, ks) = keys(&["ZUNIONSTORE", "key", "2", "key1", "key2", "WEIGHTS", "1", "2"]);
        assert_eq!(group, group::SORTED_SET);
        assert_eq!(ks, vec!["key", "key1", "key2"]);
    }

    #[test]
    fn test_eval_keys() {
        let (_, _, ks) = keys(&["EVAL", "return 1", "2", "a", "b", "arg"]);
        assert_eq!(ks, vec!["a", "b"]);
        let (_, _, ks) = keys(&["EVAL", "return 1", "0"]);
        assert!(ks.is_empty());
    }

    #[test]
    fn test_blpop_skips_timeout() {
        assert_eq!(keys(&["BLPOP", "a", "b", "0"]).2, vec!["a", "b"]);
    }

    #[test]
    fn test_container_commands() {
        let (name, group, ks) = keys(&["xgroup", "create", "stream", "g", "$"]);
        assert_eq!(name, "XGROUP-CREATE");
        assert_eq!(group, group::STREAM);
        assert_eq!(ks, vec!["stream"]);

        let (name, group, ks) = keys(&["SCRIPT", "LOAD", "return 1"]);
        assert_eq!(name, "SCRIPT-LOAD");
        assert_eq!(group, group::SCRIPTING);
        assert!(ks.is_empty());
    }

    #[test]
    fn test_hash_field_expiry_commands() {
        for cmd in [
            &["HEXPIRE", "h", "60", "FIELDS", "1", "f"][..],
            &["HPEXPIRE", "h", "60000", "FIELDS", "1", "f"],
            &["HEXPIREAT", "h", "1700000000", "FIELDS", "1", "f"],
            &["HPEXPIREAT", "h", "1700000000000", "FIELDS", "1", "f"],
            &["HPERSIST", "h", "FIELDS", "2", "f", "g"],
            &["HSETEX", "h", "EX", "10", "FIELDS", "1", "f", "v"],
            &["HGETEX", "h", "PERSIST", "FIELDS", "1", "f"],
            &["HGETDEL", "h", "FIELDS", "1", "f"],
        ] {
            let (name, grp, ks) = keys(cmd);
            assert_eq!(name, cmd[0]);
            assert_eq!(grp, group::HASH, "{}", cmd[0]);
            assert_eq!(ks, vec!["h"], "{}", cmd[0]);
        }
    }

    #[test]
    fn test_unknown_command() {
        let (name, group, ks) = keys(&["MYMODULE.DO", "x"]);
        assert_eq!(name, "MYMODULE.DO");
        assert_eq!(group, group::UNKNOWN);
        assert!(ks.is_empty());
    }

    #[test]
    fn test_truncated_command_has_no_out_of_range_keys() {
        assert!(keys(&["SET"]).2.is_empty());
        assert_eq!(keys(&["ZUNIONSTORE", "d", "5", "a"]).2, vec!["d", "a"]);
    }
}

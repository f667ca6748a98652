use super::{Command, RedisObject};
use crate::rdb::reader::RdbReader;
use crate::rdb::RdbResult;
use bytes::Bytes;
use std::io::Read;

#[derive(Debug, Clone, PartialEq)]
pub struct StringObject {
    pub key: Bytes,
    pub value: Bytes,
}

impl RedisObject for StringObject {
    fn load<R: Read>(rd: &mut RdbReader<R>, _type_byte: u8, key: Bytes) -> RdbResult<Self> {
        let value = rd.read_string()?;
        Ok(Self { key, value })
    }

    fn rewrite(&self) -> Vec<Command> {
        vec![vec![
            Bytes::from_static(b"SET"),
            self.key.clone(),
            self.value.clone(),
        ]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdb::testutil::encode_string;
    use std::io::Cursor;

    #[test]
    fn test_load_and_rewrite() {
        let mut rd = RdbReader::new(Cursor::new(encode_string(b"Ariz")));
        let obj = StringObject::load(&mut rd, 0, Bytes::from("user:101")).unwrap();
        assert_eq!(
            obj.rewrite(),
            vec![vec![
                Bytes::from("SET"),
                Bytes::from("user:101"),
                Bytes::from("Ariz")
            ]]
        );
    }
}

use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

pub fn parse_proto(arg: &str) -> Option<(&str, &str, &str)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);

    Some((proto, addr, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_proto_forms() {
        assert_eq!(
            parse_proto("tcp!127.0.0.1!5640"),
            Some(("tcp", "127.0.0.1", "5640"))
        );
        assert_eq!(
            parse_proto("unix!/tmp/sock!0"),
            Some(("unix", "/tmp/sock", "0"))
        );
        assert_eq!(parse_proto("tcp!127.0.0.1"), None);
    }
}

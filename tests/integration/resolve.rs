//! Original destination recovery on real sockets

use std::io;
use std::os::fd::BorrowedFd;
use std::sync::Arc;

use nat_redirect::nat::{
    ChainName, DestinationResolver, MemoryBackend, OriginalDestination, OriginalDstQuery,
    Translator, ADDR_TYPE_IPV4, SOCKADDR_IN_LEN,
};
use nat_redirect::ResolveError;
use tokio::net::{TcpListener, TcpStream};

/// Query that answers with a fixed `sockaddr_in`
struct Fixed([u8; SOCKADDR_IN_LEN]);

impl OriginalDstQuery for Fixed {
    fn query(&self, _fd: BorrowedFd<'_>) -> io::Result<[u8; SOCKADDR_IN_LEN]> {
        Ok(self.0)
    }
}

fn crafted(family: i32, tail: &[u8]) -> [u8; SOCKADDR_IN_LEN] {
    let mut buf = [0u8; SOCKADDR_IN_LEN];
    buf[..2].copy_from_slice(&u16::try_from(family).unwrap().to_ne_bytes());
    buf[2..2 + tail.len()].copy_from_slice(tail);
    buf
}

async fn accepted_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (client, server)
}

#[test]
fn test_decode_crafted_result() {
    let raw = crafted(libc::AF_INET, &[0x1F, 0x90, 206, 190, 36, 45]);
    let dst = OriginalDestination::from_sockaddr(&raw).unwrap();

    assert_eq!(dst.host_port(), "206.190.36.45:8080");
    assert_eq!(dst.raw(), [ADDR_TYPE_IPV4, 206, 190, 36, 45, 0x1F, 0x90]);
}

#[tokio::test]
async fn test_translator_resolves_through_query() {
    let (_client, server) = accepted_pair().await;

    let resolver = DestinationResolver::with_query(Arc::new(Fixed(crafted(
        libc::AF_INET,
        &[0x01, 0xBB, 140, 82, 112, 3],
    ))));
    let translator = Translator::with_resolver(
        ChainName::new("IT_RESOLVE").unwrap(),
        Arc::new(MemoryBackend::new()),
        resolver,
    );

    let dst = translator.resolve(&server).unwrap();
    assert_eq!(dst.to_string(), "140.82.112.3:443");
    assert_eq!(std::net::SocketAddr::from(dst).port(), 443);
}

#[tokio::test]
async fn test_ipv6_family_is_rejected() {
    let (_client, server) = accepted_pair().await;
    let resolver = DestinationResolver::with_query(Arc::new(Fixed(crafted(libc::AF_INET6, &[]))));

    let err = resolver.resolve(&server).unwrap_err();
    assert!(matches!(err, ResolveError::UnsupportedFamily(_)));
}

#[tokio::test]
async fn test_kernel_query_failure_is_an_error() {
    let (_client, server) = accepted_pair().await;
    let resolver = DestinationResolver::kernel();

    // Whether or not conntrack tracks this loopback connection, the call
    // must return rather than panic.
    match resolver.resolve(&server) {
        Ok(dst) => assert_eq!(dst.ip(), std::net::Ipv4Addr::LOCALHOST),
        Err(ResolveError::Query(_)) => {}
        Err(e) => panic!("unexpected error: {e}"),
    }

    let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    assert!(matches!(resolver.resolve(&udp), Err(ResolveError::Query(_))));
}

use std::io::Cursor;

use proptest::prelude::*;

use tordesc::consensus::DocumentKind;
use tordesc::crypto::DigestAlgorithm;
use tordesc::unrecognized::Section;
use tordesc::unrecognized::UnrecognizedKind;
use tordesc::{
    parse_annotated, parse_stream, Dialect, HiddenServiceDescriptor, NetworkStatusDocumentV3, ParseOptions,
    ParsedDocument, RouterStatusEntry, RouterStatusVersion, ServerDescriptor, Strictness, TorDocument,
};

const CONSENSUS: &str = include_str!("data/consensus");
const SERVER_DESCRIPTOR: &str = include_str!("data/server_descriptor");
const HIDDEN_SERVICE: &str = include_str!("data/hidden_service_descriptor");

const HEADER: &str = "network-status-version 3
vote-status consensus
consensus-method 26
valid-after 2017-05-25 04:00:00
fresh-until 2017-05-25 05:00:00
valid-until 2017-05-25 07:00:00
voting-delay 300 300
known-flags Authority Exit Fast Guard HSDir Running Stable V2Dir Valid
";

const AUTHORITY: &str = "dir-source moria1 D586D18309DED4CD6D57C18FDB97EFA96D330566 128.31.0.34 128.31.0.34 9131 9101
contact 1024D/28988BF5 arma mit edu
vote-digest 49015F787433103580E3B66A1707A00E60F2D15B
";

const ROUTER_LINE: &str =
    "r caerSidi p1aag7VwarGxqctS7/fS0y5FU+s oQZFLYe9e4A7bOkWKR7TaNxb0JE 2012-08-06 11:19:31 71.35.150.29 9001 0\n";

const FOOTER: &str = "directory-footer
directory-signature D586D18309DED4CD6D57C18FDB97EFA96D330566 AD8E6C36FBA6BC8E0D9C8C15D6D2E9FE2D1F1D1B
-----BEGIN SIGNATURE-----
AAAA
-----END SIGNATURE-----
";

fn consensus_with(router: &str) -> String {
    format!("{HEADER}{AUTHORITY}{router}{FOOTER}")
}

#[test]
fn test_unknown_router_status_keyword() {
    let text = consensus_with(&format!("{ROUTER_LINE}s Fast Running\nzz\n"));
    let doc = NetworkStatusDocumentV3::parse(&text, Strictness::Strict).unwrap();
    assert_eq!(1, doc.routers.len());
    assert_eq!(vec!["zz"], doc.unrecognized.lines());
    assert_eq!(1, doc.unrecognized.in_section(Section::Router).count());
    assert_eq!(vec!["zz"], doc.routers[0].unrecognized.lines());
}

#[test]
fn test_missing_vote_digest() {
    let text = consensus_with(&format!("{ROUTER_LINE}s Fast Running\n"))
        .replace("vote-digest 49015F787433103580E3B66A1707A00E60F2D15B\n", "");
    let err = NetworkStatusDocumentV3::parse(&text, Strictness::Strict).unwrap_err();
    assert!(err.to_string().contains("vote-digest"), "{}", err);

    let doc = NetworkStatusDocumentV3::parse(&text, Strictness::Permissive).unwrap();
    assert_eq!(DocumentKind::Consensus, doc.kind);
    assert_eq!(None, doc.authorities[0].vote_digest);
    assert!(doc.unrecognized.missing().contains(&"vote-digest"));
}

fn router_entries(count: usize) -> String {
    (0..count)
        .map(|i| {
            format!(
                "r relay{} p1aag7VwarGxqctS7/fS0y5FU+s oQZFLYe9e4A7bOkWKR7TaNxb0JE 2024-01-01 12:00:00 10.0.{}.{} 9001 0\ns Fast Running Valid\nw Bandwidth={}\n",
                i,
                i / 256,
                i % 256,
                i * 10
            )
        })
        .collect()
}

#[test]
fn test_stream_of_150_entries() {
    let text = router_entries(150);
    let mut reader = parse_stream(Cursor::new(text.as_bytes()), Dialect::RouterStatusV3, Strictness::Strict);
    let mut nicknames = Vec::new();
    for document in &mut reader {
        let entry = RouterStatusEntry::try_from(document.unwrap()).unwrap();
        assert_eq!(RouterStatusVersion::V3, entry.version);
        nicknames.push(entry.nickname);
    }
    let expected: Vec<String> = (0..150).map(|i| format!("relay{}", i)).collect();
    assert_eq!(expected, nicknames);
    assert_eq!(150, reader.stats().yielded);
    assert_eq!(0, reader.stats().skipped);
}

#[test]
fn test_stream_stops_early() {
    let text = router_entries(150);
    let mut reader = parse_stream(text.as_bytes(), Dialect::RouterStatusV3, Strictness::Strict);
    let first: Vec<ParsedDocument> = reader.by_ref().take(3).map(Result::unwrap).collect();
    assert_eq!(3, first.len());
    assert!(!reader.is_finished());
    assert_eq!(147, reader.count());
}

#[test]
fn test_permissive_stream_skips_broken_entries() {
    let text = router_entries(5).replace("10.0.0.2 ", "10.0.0.999 ");
    let options = ParseOptions::permissive();
    let mut reader = tordesc::parse_stream_with(text.as_bytes(), Dialect::RouterStatusV3, options);
    let nicknames: Vec<String> = reader
        .by_ref()
        .map(|d| RouterStatusEntry::try_from(d.unwrap()).unwrap().nickname)
        .collect();
    assert_eq!(vec!["relay0", "relay1", "relay3", "relay4"], nicknames);
    assert_eq!(1, reader.stats().skipped);
}

#[test]
fn test_stream_of_consensus_entries() {
    let parsed: Vec<ParsedDocument> = parse_stream(CONSENSUS.as_bytes(), Dialect::RouterStatusV3, Strictness::Strict)
        .collect::<Result<_, _>>()
        .unwrap();
    let consensus = NetworkStatusDocumentV3::parse(CONSENSUS, Strictness::Strict).unwrap();
    let entries: Vec<RouterStatusEntry> = parsed
        .into_iter()
        .map(|d| RouterStatusEntry::try_from(d).unwrap())
        .collect();
    assert_eq!(consensus.routers.len(), entries.len());
    for (streamed, embedded) in entries.iter().zip(&consensus.routers) {
        assert_eq!(embedded.fingerprint, streamed.fingerprint);
        assert_eq!(embedded.lines, streamed.lines);
    }
}

#[test]
fn test_annotated_stream() {
    let two = format!("{}{}", SERVER_DESCRIPTOR, SERVER_DESCRIPTOR);
    let reader = parse_annotated(two.as_bytes(), ParseOptions::strict()).unwrap();
    assert_eq!(Dialect::ServerDescriptor, reader.dialect());
    let descriptors: Vec<ServerDescriptor> = reader
        .map(|d| ServerDescriptor::try_from(d.unwrap()).unwrap())
        .collect();
    assert_eq!(2, descriptors.len());
    assert_eq!(descriptors[0], descriptors[1]);
    assert!(descriptors[0].raw.starts_with("router Amunet"));
}

#[test]
fn test_wrong_dialect_conversion() {
    let parsed = tordesc::parse_one(CONSENSUS.as_bytes(), Dialect::NetworkStatusV3, Strictness::Strict).unwrap();
    assert_eq!(Dialect::NetworkStatusV3, parsed.dialect());
    let err = ServerDescriptor::try_from(parsed).unwrap_err();
    assert_eq!(Dialect::NetworkStatusV3, err.actual);
    assert!(NetworkStatusDocumentV3::try_from(*err.document).is_ok());
}

#[test]
fn test_hidden_service_descriptor() {
    let reader = parse_annotated(HIDDEN_SERVICE.as_bytes(), ParseOptions::strict()).unwrap();
    assert_eq!(Dialect::HiddenServiceDescriptor, reader.dialect());
    let parsed: Vec<ParsedDocument> = reader.collect::<Result<_, _>>().unwrap();
    assert_eq!(1, parsed.len());
    let desc = HiddenServiceDescriptor::try_from(parsed.into_iter().next().unwrap()).unwrap();

    assert_eq!(Some("y3olqqblqw2gbh6phimfuiroechjjafa"), desc.descriptor_id.as_deref());
    assert_eq!(Some(2), desc.version);
    assert_eq!(Some("e24kgecavwsznj7gpbktqsiwgvngsf4e"), desc.secret_id_part.as_deref());
    assert_eq!("2015-02-23 20:00:00 UTC", desc.published.unwrap().to_string());
    assert_eq!(vec![2, 3], desc.protocol_versions);
    assert_eq!(Some("3g2upl4pq6kufc4m.onion".to_string()), desc.onion_address());
    assert!(desc.unrecognized.is_empty(), "{:?}", desc.unrecognized);
    assert_eq!(HIDDEN_SERVICE.trim_start_matches("@type hidden-service-descriptor 1.0\n"), desc.render());

    let points = desc.introduction_points(Strictness::Strict).unwrap();
    let identifiers: Vec<&str> = points.iter().map(|p| p.identifier.as_str()).collect();
    assert_eq!(
        vec![
            "iwki77xtbvp6qvedfrwdzncxs3ckayeu",
            "em4gjk6eiiualhmlyiifrzc7lbtrsbip",
            "jqhfl364x3upe6lqnxizolewlfrsw2zy"
        ],
        identifiers
    );
    assert_eq!(Some("178.62.222.129".parse().unwrap()), points[0].address);
    assert_eq!(Some(443), points[0].port);
    assert!(points.iter().all(|p| p.onion_key.is_some() && p.service_key.is_some()));
    assert!(points.iter().all(|p| p.authentication.is_empty() && p.unrecognized.is_empty()));
}

#[test]
fn test_hidden_service_descriptor_must_start_with_its_identifier() {
    let text = HIDDEN_SERVICE.replacen(
        "rendezvous-service-descriptor y3olqqblqw2gbh6phimfuiroechjjafa\nversion 2\n",
        "version 2\nrendezvous-service-descriptor y3olqqblqw2gbh6phimfuiroechjjafa\n",
        1,
    );
    let err = HiddenServiceDescriptor::parse(&text, Strictness::Strict).unwrap_err();
    assert!(err.to_string().contains("must be the first line"), "{}", err);

    let desc = HiddenServiceDescriptor::parse(&text, Strictness::Permissive).unwrap();
    assert_eq!(Some("y3olqqblqw2gbh6phimfuiroechjjafa"), desc.descriptor_id.as_deref());
    assert_eq!(1, desc.unrecognized.of_kind(UnrecognizedKind::Deferred).count());
}

#[test]
fn test_hidden_service_descriptor_must_end_with_signature() {
    let text = format!("{}protocol-versions 2\n", HIDDEN_SERVICE);
    let err = HiddenServiceDescriptor::parse(&text, Strictness::Strict).unwrap_err();
    assert!(err.to_string().contains("must be the last line"), "{}", err);

    let text = HIDDEN_SERVICE.replace("protocol-versions 2,3\n", "");
    let err = HiddenServiceDescriptor::parse(&text, Strictness::Strict).unwrap_err();
    assert!(err.to_string().contains("protocol-versions"), "{}", err);
    let desc = HiddenServiceDescriptor::parse(&text, Strictness::Permissive).unwrap();
    assert!(desc.protocol_versions.is_empty());
    assert!(desc.unrecognized.missing().contains(&"protocol-versions"));
}

#[test]
fn test_rendered_consensus_keeps_digest() {
    let doc = NetworkStatusDocumentV3::parse(CONSENSUS, Strictness::Permissive).unwrap();
    let rendered = doc.render();
    assert_eq!(CONSENSUS, rendered);
    let again = NetworkStatusDocumentV3::parse(&rendered, Strictness::Permissive).unwrap();
    for algorithm in [DigestAlgorithm::Sha1, DigestAlgorithm::Sha256] {
        assert_eq!(doc.digest(algorithm).unwrap(), again.digest(algorithm).unwrap());
    }
}

#[test]
fn test_rendered_descriptor_keeps_digest() {
    let text = SERVER_DESCRIPTOR.replace("uptime 86400\n", "uptime 86400\nzz some future line\n");
    let doc = ServerDescriptor::parse(&text, Strictness::Permissive).unwrap();
    assert_eq!(vec!["zz some future line"], doc.unrecognized.lines());
    let again = ServerDescriptor::parse(&doc.render(), Strictness::Permissive).unwrap();
    assert_eq!(doc.digest().unwrap(), again.digest().unwrap());
}

#[test]
fn test_crlf_line_endings() {
    let text = CONSENSUS.replace('\n', "\r\n");
    let doc = NetworkStatusDocumentV3::parse(&text, Strictness::Strict).unwrap();
    let plain = NetworkStatusDocumentV3::parse(CONSENSUS, Strictness::Strict).unwrap();
    assert_eq!(plain.routers.len(), doc.routers.len());
    assert_eq!(CONSENSUS, doc.render());
}

const ENTRY_LINES: &[&str] = &[
    "s Running Valid",
    "s",
    "w Bandwidth=20",
    "w Bandwidth=x",
    "v Tor 0.4.8.10",
    "p accept 80,443",
    "p bogus",
    "pr Link=1-5 Relay=2",
    "pr Link=x",
    "a [2001:db8::1]:9001",
    "a nonsense",
    "zz",
    "zz top",
    "-----BEGIN",
];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_strictness_is_monotonic(lines in proptest::collection::vec(proptest::sample::select(ENTRY_LINES), 0..6)) {
        let mut text = ROUTER_LINE.to_string();
        for line in &lines {
            text.push_str(line);
            text.push('\n');
        }
        if let Ok(strict) = RouterStatusEntry::parse(&text, RouterStatusVersion::V3, Strictness::Strict) {
            let permissive = RouterStatusEntry::parse(&text, RouterStatusVersion::V3, Strictness::Permissive);
            prop_assert!(permissive.is_ok(), "{:?}", permissive.err());
            prop_assert_eq!(strict, permissive.unwrap());
        }
    }

    #[test]
    fn prop_parsing_is_idempotent(lines in proptest::collection::vec(proptest::sample::select(ENTRY_LINES), 0..6)) {
        let mut text = ROUTER_LINE.to_string();
        for line in &lines {
            text.push_str(line);
            text.push('\n');
        }
        let first = RouterStatusEntry::parse(&text, RouterStatusVersion::V3, Strictness::Permissive);
        let second = RouterStatusEntry::parse(&text, RouterStatusVersion::V3, Strictness::Permissive);
        match (first, second) {
            (Ok(first), Ok(second)) => prop_assert_eq!(first, second),
            (Err(first), Err(second)) => prop_assert_eq!(first.to_string(), second.to_string()),
            _ => prop_assert!(false, "parsing the same text twice disagreed"),
        }
    }
}

//! Per-dialect tables of the keywords a document may contain.
//!
//! Keywords missing from a table are not errors; the [`Assembler`] files
//! them as unrecognized content.
//!
//! [`Assembler`]: crate::assembler::Assembler

use std::fmt;

use phf::phf_ordered_map;

/// How often a keyword may appear
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    ExactlyOnce,
    AtMostOnce,
    AnyNumber,
    AtLeastOnce,
}

impl Cardinality {
    pub fn is_mandatory(self) -> bool {
        matches!(self, Cardinality::ExactlyOnce | Cardinality::AtLeastOnce)
    }

    pub fn is_single(self) -> bool {
        matches!(self, Cardinality::ExactlyOnce | Cardinality::AtMostOnce)
    }
}

/// Where in its document a keyword must appear
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Any,
    First,
    Last,
}

/// What a keyword's arguments must look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgShape {
    Any,
    Present,
    Empty,
    Integer,
    Timestamp,
    /// At least this many whitespace separated arguments
    Args(usize),
}

impl fmt::Display for ArgShape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ArgShape::Any => write!(f, "anything"),
            ArgShape::Present => write!(f, "non-empty"),
            ArgShape::Empty => write!(f, "empty"),
            ArgShape::Integer => write!(f, "an integer"),
            ArgShape::Timestamp => write!(f, "a 'YYYY-MM-DD HH:MM:SS' timestamp"),
            ArgShape::Args(n) => write!(f, "at least {} arguments", n),
        }
    }
}

/// Whether a keyword must carry an object block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Any,
    Present,
    Tagged(&'static str),
}

/// Network status flavors in which a keyword is permitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Always,
    VoteOnly,
    ConsensusOnly,
}

/// The kind of document being assembled, for keywords that differ between
/// votes and consensuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Plain,
    Vote,
    Consensus,
}

impl Presence {
    pub fn permits(self, flavor: Flavor) -> bool {
        match (self, flavor) {
            (Presence::VoteOnly, Flavor::Consensus) => false,
            (Presence::ConsensusOnly, Flavor::Vote) => false,
            _ => true,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Presence::Always => "",
            Presence::VoteOnly => "only permitted in votes",
            Presence::ConsensusOnly => "only permitted in consensuses",
        }
    }
}

/// Rules for one keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub cardinality: Cardinality,
    pub position: Position,
    pub shape: ArgShape,
    pub block: Block,
    pub presence: Presence,
}

const fn field(cardinality: Cardinality, shape: ArgShape) -> FieldSpec {
    FieldSpec {
        cardinality,
        position: Position::Any,
        shape,
        block: Block::Any,
        presence: Presence::Always,
    }
}

const fn required(shape: ArgShape) -> FieldSpec {
    field(Cardinality::ExactlyOnce, shape)
}

const fn optional(shape: ArgShape) -> FieldSpec {
    field(Cardinality::AtMostOnce, shape)
}

const fn repeated(shape: ArgShape) -> FieldSpec {
    field(Cardinality::AnyNumber, shape)
}

impl FieldSpec {
    const fn first(self) -> FieldSpec {
        FieldSpec {
            position: Position::First,
            ..self
        }
    }

    const fn last(self) -> FieldSpec {
        FieldSpec {
            position: Position::Last,
            ..self
        }
    }

    const fn at_least_once(self) -> FieldSpec {
        FieldSpec {
            cardinality: Cardinality::AtLeastOnce,
            ..self
        }
    }

    const fn block(self, tag: &'static str) -> FieldSpec {
        FieldSpec {
            block: Block::Tagged(tag),
            ..self
        }
    }

    const fn any_block(self) -> FieldSpec {
        FieldSpec {
            block: Block::Present,
            ..self
        }
    }

    const fn vote_only(self) -> FieldSpec {
        FieldSpec {
            presence: Presence::VoteOnly,
            ..self
        }
    }

    const fn consensus_only(self) -> FieldSpec {
        FieldSpec {
            presence: Presence::ConsensusOnly,
            ..self
        }
    }

    pub(crate) fn presence_reason(&self) -> &'static str {
        self.presence.describe()
    }
}

/// Keyword table of one dialect, in canonical order
pub struct Schema {
    pub dialect: &'static str,
    pub fields: phf::OrderedMap<&'static str, FieldSpec>,
}

impl Schema {
    pub fn get(&self, keyword: &str) -> Option<&FieldSpec> {
        self.fields.get(keyword)
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.fields.contains_key(keyword)
    }

    /// Keywords that must be present in a document of the given flavor
    pub fn mandatory(&self, flavor: Flavor) -> impl Iterator<Item = &'static str> + '_ {
        self.fields
            .entries()
            .filter(move |(_, spec)| spec.cardinality.is_mandatory() && spec.presence.permits(flavor))
            .map(|(keyword, _)| *keyword)
    }
}

use ArgShape::{Any, Args, Empty, Integer, Present, Timestamp};

const RSA_KEY: &str = "RSA PUBLIC KEY";
const SIGNATURE: &str = "SIGNATURE";
const ED25519_CERT: &str = "ED25519 CERT";
const MESSAGE: &str = "MESSAGE";

pub static SERVER_DESCRIPTOR: Schema = Schema {
    dialect: "server descriptor",
    fields: phf_ordered_map! {
        "router" => required(Args(5)).first(),
        "bandwidth" => required(Args(3)),
        "platform" => optional(Present),
        "published" => required(Timestamp),
        "fingerprint" => optional(Present),
        "hibernating" => optional(Integer),
        "uptime" => optional(Integer),
        "onion-key" => required(Empty).block(RSA_KEY),
        "onion-key-crosscert" => optional(Empty).any_block(),
        "ntor-onion-key" => optional(Present),
        "ntor-onion-key-crosscert" => optional(Integer).block(ED25519_CERT),
        "signing-key" => required(Empty).block(RSA_KEY),
        "identity-ed25519" => optional(Empty).block(ED25519_CERT),
        "master-key-ed25519" => optional(Present),
        "family" => optional(Any),
        "or-address" => repeated(Present),
        "accept" => repeated(Present),
        "reject" => repeated(Present),
        "ipv6-policy" => optional(Args(2)),
        "contact" => optional(Any),
        "extra-info-digest" => optional(Present),
        "hidden-service-dir" => optional(Any),
        "caches-extra-info" => optional(Empty),
        "allow-single-hop-exits" => optional(Empty),
        "tunnelled-dir-server" => optional(Empty),
        "protocols" => optional(Present),
        "proto" => optional(Present),
        "bridge-distribution-request" => optional(Present),
        "router-sig-ed25519" => optional(Present),
        "router-signature" => required(Empty).block(SIGNATURE).last(),
    },
};

pub static EXTRA_INFO: Schema = Schema {
    dialect: "extra-info descriptor",
    fields: phf_ordered_map! {
        "extra-info" => required(Args(2)).first(),
        "identity-ed25519" => optional(Empty).block(ED25519_CERT),
        "published" => required(Timestamp),
        "geoip-db-digest" => optional(Present),
        "geoip6-db-digest" => optional(Present),
        "transport" => repeated(Present),
        "read-history" => optional(Args(4)),
        "write-history" => optional(Args(4)),
        "dirreq-read-history" => optional(Args(4)),
        "dirreq-write-history" => optional(Args(4)),
        "conn-bi-direct" => optional(Any),
        "dirreq-stats-end" => optional(Any),
        "dirreq-v3-ips" => optional(Any),
        "dirreq-v3-reqs" => optional(Any),
        "dirreq-v3-resp" => optional(Any),
        "dirreq-v3-direct-dl" => optional(Any),
        "dirreq-v3-tunneled-dl" => optional(Any),
        "entry-stats-end" => optional(Any),
        "entry-ips" => optional(Any),
        "exit-stats-end" => optional(Any),
        "exit-kibibytes-written" => optional(Any),
        "exit-kibibytes-read" => optional(Any),
        "exit-streams-opened" => optional(Any),
        "cell-stats-end" => optional(Any),
        "cell-processed-cells" => optional(Any),
        "cell-queued-cells" => optional(Any),
        "cell-time-in-queue" => optional(Any),
        "cell-circuits-per-decile" => optional(Any),
        "hidserv-stats-end" => optional(Any),
        "hidserv-rend-relayed-cells" => optional(Any),
        "hidserv-dir-onions-seen" => optional(Any),
        "padding-counts" => optional(Any),
        "bridge-stats-end" => optional(Any),
        "bridge-ips" => optional(Any),
        "bridge-ip-versions" => optional(Any),
        "bridge-ip-transports" => optional(Any),
        "router-digest" => optional(Present),
        "router-digest-sha256" => optional(Present),
        "router-sig-ed25519" => optional(Present),
        "router-signature" => required(Empty).block(SIGNATURE).last(),
    },
};

pub static MICRODESCRIPTOR: Schema = Schema {
    dialect: "microdescriptor",
    fields: phf_ordered_map! {
        "onion-key" => required(Empty).block(RSA_KEY).first(),
        "ntor-onion-key" => optional(Present),
        "a" => repeated(Present),
        "family" => optional(Any),
        "p" => optional(Args(2)),
        "p6" => optional(Args(2)),
        "pr" => optional(Any),
        "id" => repeated(Args(2)),
    },
};

pub static ROUTER_STATUS_V2: Schema = Schema {
    dialect: "router status entry v2",
    fields: phf_ordered_map! {
        "r" => required(Args(8)).first(),
        "a" => repeated(Present),
        "s" => optional(Any),
        "v" => optional(Any),
        "w" => optional(Present),
        "p" => optional(Args(2)),
    },
};

pub static ROUTER_STATUS_V3: Schema = Schema {
    dialect: "router status entry v3",
    fields: phf_ordered_map! {
        "r" => required(Args(8)).first(),
        "a" => repeated(Present),
        "s" => required(Any),
        "v" => optional(Any),
        "pr" => optional(Any),
        "w" => optional(Present),
        "p" => optional(Args(2)),
        "id" => optional(Args(2)),
        "m" => repeated(Present),
    },
};

pub static ROUTER_STATUS_MICRO_V3: Schema = Schema {
    dialect: "microdescriptor router status entry v3",
    fields: phf_ordered_map! {
        "r" => required(Args(7)).first(),
        "a" => repeated(Present),
        "s" => required(Any),
        "v" => optional(Any),
        "pr" => optional(Any),
        "w" => optional(Present),
        "p" => optional(Args(2)),
        "m" => required(Present),
    },
};

pub static NETWORK_STATUS_V2: Schema = Schema {
    dialect: "network status document v2",
    fields: phf_ordered_map! {
        "network-status-version" => required(Integer).first(),
        "dir-source" => required(Args(3)),
        "fingerprint" => required(Present),
        "contact" => required(Any),
        "dir-signing-key" => required(Empty).block(RSA_KEY),
        "client-versions" => required(Any),
        "server-versions" => required(Any),
        "published" => required(Timestamp),
        "dir-options" => optional(Any),
        "directory-signature" => required(Present).block(SIGNATURE).last(),
    },
};

pub static NETWORK_STATUS_V3_HEADER: Schema = Schema {
    dialect: "network status document v3",
    fields: phf_ordered_map! {
        "network-status-version" => required(Present).first(),
        "vote-status" => required(Present),
        "consensus-methods" => required(Present).vote_only(),
        "consensus-method" => required(Integer).consensus_only(),
        "published" => required(Timestamp).vote_only(),
        "valid-after" => required(Timestamp),
        "fresh-until" => required(Timestamp),
        "valid-until" => required(Timestamp),
        "voting-delay" => required(Args(2)),
        "client-versions" => optional(Any),
        "server-versions" => optional(Any),
        "package" => repeated(Present),
        "known-flags" => required(Any),
        "flag-thresholds" => optional(Any).vote_only(),
        "recommended-client-protocols" => optional(Any),
        "recommended-relay-protocols" => optional(Any),
        "required-client-protocols" => optional(Any),
        "required-relay-protocols" => optional(Any),
        "params" => optional(Any),
        "shared-rand-participate" => optional(Empty).vote_only(),
        "shared-rand-commit" => repeated(Present).vote_only(),
        "shared-rand-previous-value" => optional(Args(2)),
        "shared-rand-current-value" => optional(Args(2)),
        "bandwidth-file-headers" => optional(Any).vote_only(),
        "bandwidth-file-digest" => optional(Present).vote_only(),
    },
};

pub static NETWORK_STATUS_V3_FOOTER: Schema = Schema {
    dialect: "network status document v3 footer",
    fields: phf_ordered_map! {
        "directory-footer" => optional(Empty),
        "bandwidth-weights" => optional(Any).consensus_only(),
        "directory-signature" => repeated(Args(2)).block(SIGNATURE).at_least_once(),
    },
};

pub static DIRECTORY_AUTHORITY: Schema = Schema {
    dialect: "directory authority",
    fields: phf_ordered_map! {
        "dir-source" => required(Args(6)).first(),
        "contact" => required(Any),
        "legacy-dir-key" => optional(Present),
        "vote-digest" => required(Present).consensus_only(),
        "shared-rand-participate" => optional(Empty),
        "shared-rand-commit" => repeated(Present),
        "shared-rand-previous-value" => optional(Args(2)),
        "shared-rand-current-value" => optional(Args(2)),
    },
};

pub static KEY_CERTIFICATE: Schema = Schema {
    dialect: "key certificate",
    fields: phf_ordered_map! {
        "dir-key-certificate-version" => required(Integer).first(),
        "dir-address" => optional(Present),
        "fingerprint" => required(Present),
        "dir-identity-key" => required(Empty).block(RSA_KEY),
        "dir-key-published" => required(Timestamp),
        "dir-key-expires" => required(Timestamp),
        "dir-signing-key" => required(Empty).block(RSA_KEY),
        "dir-key-crosscert" => optional(Empty).any_block(),
        "dir-key-certification" => required(Empty).block(SIGNATURE).last(),
    },
};

pub static HIDDEN_SERVICE_DESCRIPTOR: Schema = Schema {
    dialect: "hidden service descriptor",
    fields: phf_ordered_map! {
        "rendezvous-service-descriptor" => required(Present).first(),
        "version" => required(Integer),
        "permanent-key" => required(Empty).block(RSA_KEY),
        "secret-id-part" => required(Present),
        "publication-time" => required(Timestamp),
        "protocol-versions" => required(Present),
        "introduction-points" => optional(Empty).block(MESSAGE),
        "signature" => required(Empty).block(SIGNATURE).last(),
    },
};

/// Entries of a decoded `introduction-points` block
pub static INTRODUCTION_POINT: Schema = Schema {
    dialect: "introduction point",
    fields: phf_ordered_map! {
        "introduction-point" => required(Present).first(),
        "ip-address" => required(Present),
        "onion-port" => required(Integer),
        "onion-key" => required(Empty).block(RSA_KEY),
        "service-key" => required(Empty).block(RSA_KEY),
        "intro-authentication" => repeated(Args(2)),
    },
};

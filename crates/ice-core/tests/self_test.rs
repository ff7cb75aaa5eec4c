//! End-to-end exercise of the pair-state machine and scheduler between two
//! sessions, using a hand-rolled stand-in for the STUN codec (real STUN
//! encoding is out of scope for this crate — see [`ice_core::stun`]).

use std::mem::take;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use ice_core::stun::{Class, ErrorCode, StunCodec, StunDecodeError, StunMessage};
use ice_core::{
    CandidateType, CheckList, CheckListState, Component, Effect, IceCredentials, PairState, ReceivedPkt, Role,
    Session, SessionConfig, TransportAddress,
};

/// Not a real STUN wire format — this crate treats STUN encoding as an
/// external collaborator (§6). MESSAGE-INTEGRITY is simulated by embedding
/// the key used at encode time so `verify_integrity_short_term` can compare.
struct TestCodec;

impl TestCodec {
    fn put_str(buf: &mut Vec<u8>, s: &str) {
        buf.extend((s.len() as u32).to_be_bytes());
        buf.extend(s.as_bytes());
    }

    fn take_str(buf: &[u8], pos: &mut usize) -> String {
        let len = u32::from_be_bytes(buf[*pos..*pos + 4].try_into().unwrap()) as usize;
        *pos += 4;
        let s = String::from_utf8(buf[*pos..*pos + len].to_vec()).unwrap();
        *pos += len;
        s
    }

    fn put_opt_str(buf: &mut Vec<u8>, v: &Option<String>) {
        match v {
            Some(s) => {
                buf.push(1);
                Self::put_str(buf, s);
            }
            None => buf.push(0),
        }
    }

    fn take_opt_str(buf: &[u8], pos: &mut usize) -> Option<String> {
        let tag = buf[*pos];
        *pos += 1;
        if tag == 1 {
            Some(Self::take_str(buf, pos))
        } else {
            None
        }
    }

    fn put_opt_u32(buf: &mut Vec<u8>, v: Option<u32>) {
        match v {
            Some(x) => {
                buf.push(1);
                buf.extend(x.to_be_bytes());
            }
            None => buf.push(0),
        }
    }

    fn take_opt_u32(buf: &[u8], pos: &mut usize) -> Option<u32> {
        let tag = buf[*pos];
        *pos += 1;
        if tag == 1 {
            let v = u32::from_be_bytes(buf[*pos..*pos + 4].try_into().unwrap());
            *pos += 4;
            Some(v)
        } else {
            None
        }
    }

    fn put_opt_u64(buf: &mut Vec<u8>, v: Option<u64>) {
        match v {
            Some(x) => {
                buf.push(1);
                buf.extend(x.to_be_bytes());
            }
            None => buf.push(0),
        }
    }

    fn take_opt_u64(buf: &[u8], pos: &mut usize) -> Option<u64> {
        let tag = buf[*pos];
        *pos += 1;
        if tag == 1 {
            let v = u64::from_be_bytes(buf[*pos..*pos + 8].try_into().unwrap());
            *pos += 8;
            Some(v)
        } else {
            None
        }
    }

    fn put_opt_addr(buf: &mut Vec<u8>, v: Option<TransportAddress>) {
        match v {
            Some(addr) => {
                buf.push(1);
                match addr.ip {
                    IpAddr::V4(v4) => {
                        buf.push(4);
                        buf.extend(v4.octets());
                    }
                    IpAddr::V6(v6) => {
                        buf.push(6);
                        buf.extend(v6.octets());
                    }
                }
                buf.extend(addr.port.to_be_bytes());
            }
            None => buf.push(0),
        }
    }

    fn take_opt_addr(buf: &[u8], pos: &mut usize) -> Option<TransportAddress> {
        let tag = buf[*pos];
        *pos += 1;
        if tag == 0 {
            return None;
        }
        let family = buf[*pos];
        *pos += 1;
        let ip = if family == 4 {
            let mut o = [0u8; 4];
            o.copy_from_slice(&buf[*pos..*pos + 4]);
            *pos += 4;
            IpAddr::V4(Ipv4Addr::from(o))
        } else {
            let mut o = [0u8; 16];
            o.copy_from_slice(&buf[*pos..*pos + 16]);
            *pos += 16;
            IpAddr::V6(Ipv6Addr::from(o))
        };
        let port = u16::from_be_bytes(buf[*pos..*pos + 2].try_into().unwrap());
        *pos += 2;
        Some(TransportAddress::new(ip, port))
    }
}

impl StunCodec for TestCodec {
    fn encode(&self, msg: &StunMessage, integrity_key: Option<&[u8]>) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(match msg.class {
            Class::Request => 0,
            Class::Success => 1,
            Class::Error => 2,
            Class::Indication => 3,
        });
        buf.extend(msg.transaction_id);
        Self::put_opt_str(&mut buf, &msg.username);
        buf.push(integrity_key.is_some() as u8);
        if let Some(key) = integrity_key {
            Self::put_str(&mut buf, std::str::from_utf8(key).unwrap());
        }
        buf.push(msg.fingerprint as u8);
        Self::put_opt_u32(&mut buf, msg.priority);
        buf.push(msg.use_candidate as u8);
        Self::put_opt_u64(&mut buf, msg.ice_controlling);
        Self::put_opt_u64(&mut buf, msg.ice_controlled);
        Self::put_opt_addr(&mut buf, msg.xor_mapped_address);
        match &msg.error_code {
            Some(e) => {
                buf.push(1);
                buf.extend(e.number.to_be_bytes());
                Self::put_str(&mut buf, &e.reason);
            }
            None => buf.push(0),
        }
        buf
    }

    fn decode(&self, bytes: &[u8]) -> Result<StunMessage, StunDecodeError> {
        if bytes.len() < 14 {
            return Err(StunDecodeError);
        }
        let mut pos = 0;
        let class = match bytes[pos] {
            0 => Class::Request,
            1 => Class::Success,
            2 => Class::Error,
            3 => Class::Indication,
            _ => return Err(StunDecodeError),
        };
        pos += 1;
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[pos..pos + 12]);
        pos += 12;

        let username = Self::take_opt_str(bytes, &mut pos);
        let message_integrity = bytes[pos] == 1;
        pos += 1;
        if message_integrity {
            let _ = Self::take_str(bytes, &mut pos);
        }
        let fingerprint = bytes[pos] == 1;
        pos += 1;
        let priority = Self::take_opt_u32(bytes, &mut pos);
        let use_candidate = bytes[pos] == 1;
        pos += 1;
        let ice_controlling = Self::take_opt_u64(bytes, &mut pos);
        let ice_controlled = Self::take_opt_u64(bytes, &mut pos);
        let xor_mapped_address = Self::take_opt_addr(bytes, &mut pos);
        let error_code = if bytes[pos] == 1 {
            pos += 1;
            let number = u16::from_be_bytes(bytes[pos..pos + 2].try_into().unwrap());
            pos += 2;
            let reason = Self::take_str(bytes, &mut pos);
            Some(ErrorCode::new(number, reason))
        } else {
            None
        };

        Ok(StunMessage {
            class,
            transaction_id,
            username,
            message_integrity,
            fingerprint,
            priority,
            use_candidate,
            ice_controlling,
            ice_controlled,
            xor_mapped_address,
            error_code,
        })
    }

    fn verify_integrity_short_term(&self, bytes: &[u8], key: &[u8]) -> bool {
        let mut pos = 13;
        let _ = Self::take_opt_str(bytes, &mut pos);
        if bytes[pos] != 1 {
            return false;
        }
        pos += 1;
        let embedded = Self::take_str(bytes, &mut pos);
        embedded.as_bytes() == key
    }
}

struct Packet {
    data: Vec<u8>,
    source: TransportAddress,
    destination: TransportAddress,
}

fn create_pair() -> (Session, Session, TransportAddress, TransportAddress) {
    let a_creds = IceCredentials::random();
    let b_creds = IceCredentials::random();

    let mut a = Session::new(SessionConfig::new(Role::Controlling, a_creds.clone()));
    let mut b = Session::new(SessionConfig::new(Role::Controlled, b_creds.clone()));
    a.set_remote_credentials(b_creds);
    b.set_remote_credentials(a_creds);

    let a_addr = TransportAddress::new(IpAddr::from([192, 168, 178, 2]), 5555);
    let b_addr = TransportAddress::new(IpAddr::from([192, 168, 178, 3]), 5555);

    a.add_check_list();
    b.add_check_list();

    let a_local = a
        .check_list_mut(0)
        .add_local_candidate(CandidateType::Host, a_addr, Component::Rtp.id(), None)
        .unwrap();
    let b_local = b
        .check_list_mut(0)
        .add_local_candidate(CandidateType::Host, b_addr, Component::Rtp.id(), None)
        .unwrap();

    a.compute_candidates_foundations();
    b.compute_candidates_foundations();

    let a_cand = a.check_list(0).local_candidate(a_local).clone();
    let b_cand = b.check_list(0).local_candidate(b_local).clone();

    b.check_list_mut(0)
        .add_remote_candidate(a_cand.typ, a_cand.taddr, a_cand.component_id, a_cand.priority, a_cand.foundation)
        .unwrap();
    a.check_list_mut(0)
        .add_remote_candidate(b_cand.typ, b_cand.taddr, b_cand.component_id, b_cand.priority, b_cand.foundation)
        .unwrap();

    a.choose_default_candidates();
    b.choose_default_candidates();
    a.pair_candidates(0);
    b.pair_candidates(0);

    (a, b, a_addr, b_addr)
}

fn route(effects: Vec<Effect>, source: TransportAddress, inbox: &mut Vec<Packet>) {
    for effect in effects {
        if let Effect::SendStun { bytes, dest, .. } = effect {
            inbox.push(Packet { data: bytes, source, destination: dest });
        }
    }
}

#[test]
fn same_network() {
    let _ = env_logger::try_init();
    let (mut a, mut b, a_addr, b_addr) = create_pair();
    let codec = TestCodec;

    let mut to_b = Vec::new();
    let mut to_a = Vec::new();
    let mut now = Instant::now();

    for _ in 0..2000 {
        if a.check_list(0).state() == CheckListState::Completed && b.check_list(0).state() == CheckListState::Completed {
            break;
        }

        route(a.process_all(now, &codec), a_addr, &mut to_b);
        route(b.process_all(now, &codec), b_addr, &mut to_a);

        for pkt in take(&mut to_a) {
            let received = ReceivedPkt {
                data: &pkt.data,
                source: pkt.source,
                destination: pkt.destination,
                component_id: Component::Rtp.id(),
            };
            route(a.handle_stun_packet(0, &codec, &received), a_addr, &mut to_b);
        }
        for pkt in take(&mut to_b) {
            let received = ReceivedPkt {
                data: &pkt.data,
                source: pkt.source,
                destination: pkt.destination,
                component_id: Component::Rtp.id(),
            };
            route(b.handle_stun_packet(0, &codec, &received), b_addr, &mut to_a);
        }

        now += Duration::from_millis(20);
    }

    assert_eq!(a.check_list(0).state(), CheckListState::Completed);
    assert_eq!(b.check_list(0).state(), CheckListState::Completed);

    let (rtp, _) = a.check_list(0).nominated_remote_addrs();
    assert_eq!(rtp, Some(b_addr));
}

#[test]
fn retransmission_exhaustion_fails_the_stream() {
    let _ = env_logger::try_init();
    let creds = IceCredentials::random();
    let mut a = Session::new(SessionConfig::new(Role::Controlling, creds));
    a.set_remote_credentials(IceCredentials::random());
    a.add_check_list();

    let addr = TransportAddress::new(IpAddr::from([10, 0, 0, 1]), 4444);
    let remote = TransportAddress::new(IpAddr::from([10, 0, 0, 2]), 4444);

    a.check_list_mut(0)
        .add_local_candidate(CandidateType::Host, addr, Component::Rtp.id(), None)
        .unwrap();
    a.check_list_mut(0)
        .add_remote_candidate(CandidateType::Host, remote, Component::Rtp.id(), 2_130_706_431, "f0".into())
        .unwrap();
    a.compute_candidates_foundations();
    a.pair_candidates(0);

    let codec = TestCodec;
    let mut now = Instant::now();

    for _ in 0..40 {
        a.process_all(now, &codec);
        if a.check_list(0).state() == CheckListState::Failed {
            break;
        }
        now += Duration::from_millis(200);
    }

    assert_eq!(a.check_list(0).state(), CheckListState::Failed);
    assert!(a.check_list(0).pairs().iter().all(|p| p.state == PairState::Failed));
}

#[test]
fn eleventh_local_candidate_is_rejected() {
    let creds = IceCredentials::random();
    let mut a = Session::new(SessionConfig::new(Role::Controlling, creds));
    a.add_check_list();

    for i in 0..10u16 {
        let addr = TransportAddress::new(IpAddr::from([10, 0, 0, 1]), 5000 + i);
        a.check_list_mut(0)
            .add_local_candidate(CandidateType::Host, addr, Component::Rtp.id(), None)
            .unwrap();
    }

    let eleventh = TransportAddress::new(IpAddr::from([10, 0, 0, 1]), 5010);
    assert!(a
        .check_list_mut(0)
        .add_local_candidate(CandidateType::Host, eleventh, Component::Rtp.id(), None)
        .is_err());
}

#[test]
fn keepalive_timeout_is_clamped_to_15s() {
    let creds = IceCredentials::random();
    let mut cfg = SessionConfig::new(Role::Controlling, creds);
    cfg.set_keepalive_timeout_s(3);
    assert_eq!(cfg.keepalive_timeout_s(), 15);

    cfg.set_keepalive_timeout_s(60);
    assert_eq!(cfg.keepalive_timeout_s(), 60);
}

#[test]
fn a_single_pair_starts_out_not_yet_valid() {
    let creds = IceCredentials::random();
    let mut a = Session::new(SessionConfig::new(Role::Controlling, creds));
    a.add_check_list();

    let local_addr = TransportAddress::new(IpAddr::from([10, 0, 0, 1]), 5000);
    let remote_addr = TransportAddress::new(IpAddr::from([10, 0, 0, 2]), 5000);
    a.check_list_mut(0)
        .add_local_candidate(CandidateType::Host, local_addr, Component::Rtp.id(), None)
        .unwrap();
    a.check_list_mut(0)
        .add_remote_candidate(CandidateType::Host, remote_addr, Component::Rtp.id(), 2_130_706_431, "f0".into())
        .unwrap();
    a.compute_candidates_foundations();
    a.pair_candidates(0);

    let cl: &CheckList = a.check_list(0);
    assert_eq!(cl.pairs().len(), 1);
    assert!(cl.valid_list().is_empty());
}

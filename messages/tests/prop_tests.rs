use proptest::prelude::*;

use strand_messages::{decode, encode, Message, MessageHeader, MessageType};
use strand_types::{Account, Amount, BlockHash, HashOrAccount, NetworkId};

proptest! {
    /// Arbitrary bytes never panic the decoder; they either parse or
    /// yield a typed error.
    #[test]
    fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode(&bytes, NetworkId::Dev);
    }

    /// Header parsing never panics on arbitrary 8-byte inputs.
    #[test]
    fn header_parse_never_panics(bytes in prop::array::uniform8(0u8..)) {
        let _ = MessageHeader::from_bytes(&bytes);
    }

    /// Valid headers roundtrip through their wire form.
    #[test]
    fn header_roundtrip(extensions in any::<u16>()) {
        let mut header = MessageHeader::new(NetworkId::Test, MessageType::ConfirmReq);
        header.extensions = extensions;
        prop_assert_eq!(MessageHeader::from_bytes(&header.to_bytes()).unwrap(), header);
    }

    /// bulk_pull requests survive the frame.
    #[test]
    fn bulk_pull_roundtrip(
        start in prop::array::uniform32(0u8..),
        end in prop::array::uniform32(0u8..),
        count in any::<u32>(),
    ) {
        let message = Message::BulkPull {
            start: HashOrAccount::new(start),
            end: BlockHash::new(end),
            count,
        };
        let bytes = encode(&message, NetworkId::Dev).unwrap();
        prop_assert_eq!(decode(&bytes, NetworkId::Dev).unwrap(), message);
    }

    /// frontier_req and bulk_pull_account requests survive the frame.
    #[test]
    fn account_requests_roundtrip(
        account in prop::array::uniform32(0u8..),
        age in any::<u32>(),
        count in any::<u32>(),
        minimum in any::<u128>(),
    ) {
        let frontier = Message::FrontierReq {
            start: Account::from_bytes(account),
            age,
            count,
        };
        let bytes = encode(&frontier, NetworkId::Dev).unwrap();
        prop_assert_eq!(decode(&bytes, NetworkId::Dev).unwrap(), frontier);

        let pending = Message::BulkPullAccount {
            account: Account::from_bytes(account),
            minimum_amount: Amount::raw(minimum),
            flags: Default::default(),
        };
        let bytes = encode(&pending, NetworkId::Dev).unwrap();
        prop_assert_eq!(decode(&bytes, NetworkId::Dev).unwrap(), pending);
    }
}

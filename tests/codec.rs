//! Codec behaviour: JSON to wire values and back

use busbridge_core::codec::{
    decode_body, decode_one, encode_one, encode_sequence, length_of_one_type, MessageReader,
    WireValue,
};
use busbridge_core::BridgeError;
use serde_json::{json, Value};

fn round_trip(signature: &str, value: Value) -> Value {
    let (wire, used) = encode_one(signature, &value).unwrap();
    assert_eq!(used, signature.len(), "signature '{signature}' not fully consumed");
    let body = [wire];
    let mut reader = MessageReader::new(&body);
    let decoded = decode_one(&mut reader).unwrap().unwrap();
    assert!(decode_one(&mut reader).unwrap().is_none());
    decoded
}

#[test]
fn test_scalar_round_trips() {
    let cases = [
        ("y", json!(200)),
        ("b", json!(true)),
        ("b", json!(false)),
        ("n", json!(-32768)),
        ("q", json!(65535)),
        ("i", json!(-2147483648i64)),
        ("u", json!(4294967295u64)),
        ("x", json!(i64::MIN)),
        ("t", json!(u64::MAX)),
        ("s", json!("hello")),
        ("o", json!("/org/example/Object")),
        ("g", json!("a{sv}")),
    ];
    for (signature, value) in cases {
        assert_eq!(round_trip(signature, value.clone()), value, "signature '{signature}'");
    }
}

#[test]
fn test_double_round_trip_is_exact() {
    for value in [0.1, -2.5e300, 1.0 / 3.0] {
        let decoded = round_trip("d", json!(value));
        assert_eq!(decoded.as_f64(), Some(value));
    }
    // integral JSON numbers are accepted for doubles
    assert_eq!(round_trip("d", json!(3)).as_f64(), Some(3.0));
}

#[test]
fn test_non_finite_double_decodes_to_null() {
    let decoded = decode_body(&[WireValue::Double(f64::NAN)]).unwrap();
    assert_eq!(decoded, json!([null]));
}

#[test]
fn test_length_matches_consumed_signature() {
    let fragments = [
        ("i", json!(1)),
        ("as", json!(["a", "b"])),
        ("a{si}", json!({"a": 1})),
        ("(isb)", json!([1, "x", true])),
        ("a(ia{sv})", json!([[1, {"k": "v"}]])),
        ("aai", json!([[1], [2, 3]])),
        ("v", json!({"nested": [1, 2]})),
        ("a{ias}", json!([[1, ["x"]]])),
    ];
    for (fragment, value) in fragments {
        let with_tail = format!("{fragment}s");
        let expected = length_of_one_type(&with_tail, false, true).unwrap();
        assert_eq!(expected, fragment.len(), "length of '{fragment}'");
        let (_, used) = encode_one(&with_tail, &value).unwrap();
        assert_eq!(used, expected, "encoder consumption for '{fragment}'");
    }
}

#[test]
fn test_malformed_signatures() {
    for signature in ["", "(", "(i", "()", ")", "}", "{si}", "a{vi}", "a{sii}", "a{s}", "a", "z"] {
        assert!(
            matches!(
                length_of_one_type(signature, false, true),
                Err(BridgeError::MalformedSignature(_))
            ),
            "'{signature}' should be malformed"
        );
    }
    // dict entry keys must be basic
    assert!(length_of_one_type("a{(i)s}", false, true).is_err());
    assert!(length_of_one_type("a{as}", false, true).is_err());
}

#[test]
fn test_boundary_rejection() {
    let rejected = [("y", json!(256)), ("n", json!(32768)), ("u", json!(-1)), ("y", json!(-1))];
    for (signature, value) in rejected {
        assert!(
            matches!(
                encode_one(signature, &value),
                Err(BridgeError::RangeError { .. })
            ),
            "{value} should not fit '{signature}'"
        );
    }

    let accepted = [("y", json!(255)), ("n", json!(32767)), ("u", json!(4294967295u64))];
    for (signature, value) in accepted {
        assert!(encode_one(signature, &value).is_ok(), "{value} should fit '{signature}'");
    }
}

#[test]
fn test_uint64_takes_negative_bit_pattern() {
    let (wire, _) = encode_one("t", &json!(-1)).unwrap();
    assert_eq!(wire, WireValue::UInt64(u64::MAX));
}

#[test]
fn test_dictionary_round_trip() {
    let body = encode_sequence("a{si}", Some(&json!({"a": 1, "b": 2}))).unwrap();
    let decoded = decode_body(&body).unwrap();
    assert_eq!(decoded, json!([{"a": 1, "b": 2}]));

    let body = encode_sequence("ai", Some(&json!([1, 2]))).unwrap();
    assert_eq!(decode_body(&body).unwrap(), json!([[1, 2]]));
}

#[test]
fn test_object_against_plain_array_is_mismatch() {
    assert!(matches!(
        encode_one("ai", &json!({"a": 1})),
        Err(BridgeError::TypeMismatch { .. })
    ));
    // non-string keyed dictionaries only accept [key, value] pairs
    assert!(matches!(
        encode_one("a{is}", &json!({"1": "x"})),
        Err(BridgeError::TypeMismatch { .. })
    ));
    let (wire, _) = encode_one("a{is}", &json!([[1, "x"]])).unwrap();
    assert_eq!(decode_body(&[wire]).unwrap(), json!([[[1, "x"]]]));
}

#[test]
fn test_variant_infers_signature() {
    let (wire, used) = encode_one("v", &json!("text")).unwrap();
    assert_eq!(used, 1);
    assert_eq!(wire, WireValue::variant("s", WireValue::string("text")));

    let (wire, _) = encode_one("v", &json!(1.5)).unwrap();
    assert_eq!(wire, WireValue::variant("d", WireValue::Double(1.5)));

    let (wire, _) = encode_one("v", &json!({"k": true})).unwrap();
    assert!(matches!(wire, WireValue::Variant { ref signature, .. } if signature == "a{sv}"));

    assert!(encode_one("v", &Value::Null).is_err());
    assert!(matches!(
        encode_one("v", &json!(1u64 << 40)),
        Err(BridgeError::RangeError { .. })
    ));
}

#[test]
fn test_sequence_arity() {
    let body = encode_sequence("sib", Some(&json!(["a", 2, true]))).unwrap();
    assert_eq!(body.len(), 3);

    assert!(encode_sequence("si", Some(&json!(["a"]))).is_err());
    assert!(encode_sequence("s", Some(&json!(["a", "b"]))).is_err());
    assert!(encode_sequence("si", Some(&json!("a"))).is_err());
    assert!(encode_sequence("s", None).is_err());
    assert_eq!(encode_sequence("", None).unwrap(), Vec::new());
    assert_eq!(encode_sequence("", Some(&json!([]))).unwrap(), Vec::new());

    // a single value stands for a one-element body
    let body = encode_sequence("s", Some(&json!("hi"))).unwrap();
    assert_eq!(body, vec![WireValue::string("hi")]);
}

#[test]
fn test_struct_and_nested_containers() {
    let value = json!([7, {"name": ["x", 1]}, [true, false]]);
    let body = encode_sequence("(ia{sv}ab)", Some(&json!([value.clone()]))).unwrap();
    let decoded = decode_body(&body).unwrap();
    // variants decode as one-element arrays
    assert_eq!(decoded, json!([[7, {"name": [[["x"], [1]]]}, [true, false]]]));
}

#[test]
fn test_string_types_require_strings() {
    assert!(matches!(
        encode_one("s", &json!(5)),
        Err(BridgeError::TypeMismatch { .. })
    ));
    assert!(matches!(
        encode_one("b", &json!([1])),
        Err(BridgeError::TypeMismatch { .. })
    ));
    assert!(matches!(
        encode_one("i", &json!(1.5)),
        Err(BridgeError::TypeMismatch { .. })
    ));
}

#[test]
fn test_malformed_dictionary_wire_data() {
    let body = [WireValue::Array {
        element: "{sv}".into(),
        items: vec![WireValue::Int32(1)],
    }];
    assert!(matches!(
        decode_body(&body),
        Err(BridgeError::MalformedWireData(_))
    ));

    let body = [WireValue::Array {
        element: "{sv}".into(),
        items: vec![WireValue::dict_entry(WireValue::Int32(1), WireValue::Bool(true))],
    }];
    assert!(matches!(
        decode_body(&body),
        Err(BridgeError::MalformedWireData(_))
    ));
}

use super::{SignatureError, SignatureTree, TypeCode, MAX_SIGNATURE};

use SignatureError::*;

macro_rules! test {
    ($input:expr, $expected:pat) => {{
        let actual = SignatureTree::new($input).map(|_| ());

        assert!(
            matches!(actual, $expected),
            "{:?}: {actual:?} does not match {}",
            $input,
            stringify!($expected)
        );
    }};
}

#[test]
fn signature_tests() {
    test!("", Ok(..));
    test!("sss", Ok(..));
    test!("i", Ok(..));
    test!("b", Ok(..));
    test!("ai", Ok(..));
    test!("(i)", Ok(..));
    test!("a{sv}", Ok(..));
    test!("aa{ss}", Ok(..));
    test!("(a{sv}ai)", Ok(..));
    test!("w", Err(UnknownTypeCode(..)));
    test!("a", Err(MissingArrayElementType));
    test!("aaaaaa", Err(MissingArrayElementType));
    test!("ii(ii)a", Err(MissingArrayElementType));
    test!("ia", Err(MissingArrayElementType));
    test!(")", Err(StructEndedButNotStarted));
    test!("}", Err(DictEndedButNotStarted));
    test!("i)", Err(StructEndedButNotStarted));
    test!("a)", Err(MissingArrayElementType));
    test!("(", Err(StructStartedButNotEnded));
    test!("(i", Err(StructStartedButNotEnded));
    test!("(iiiii", Err(StructStartedButNotEnded));
    test!("(ai", Err(StructStartedButNotEnded));
    test!("()", Err(StructHasNoFields));
    test!("(())", Err(StructHasNoFields));
    test!("a()", Err(StructHasNoFields));
    test!("i()", Err(StructHasNoFields));
    test!("()i", Err(StructHasNoFields));
    test!("(a)", Err(MissingArrayElementType));
    test!("a{ia}", Err(MissingArrayElementType));
    test!("a{}", Err(DictEntryHasNoFields));
    test!("a{aii}", Err(DictKeyMustBeBasicType));
    test!(" ", Err(UnknownTypeCode(..)));
    test!("not a valid signature", Err(UnknownTypeCode(..)));
    test!("123", Err(UnknownTypeCode(..)));
    test!(".", Err(UnknownTypeCode(..)));
    /* https://bugs.freedesktop.org/show_bug.cgi?id=17803 */
    test!("a{(ii)i}", Err(DictKeyMustBeBasicType));
    test!("a{i}", Err(DictEntryHasOnlyOneField));
    test!("{is}", Err(DictEntryNotInsideArray));
    test!("a{isi}", Err(DictEntryHasTooManyFields));
}

#[test]
fn length_limits() {
    test!(&"i".repeat(255), Ok(..));
    test!(&"i".repeat(MAX_SIGNATURE + 1), Err(SignatureTooLong));
}

#[test]
fn depth_limits() {
    // 32 levels of array nesting is the maximum.
    let ok = format!("{}i", "a".repeat(32));
    let too_deep = format!("{}i", "a".repeat(33));
    test!(&ok, Ok(..));
    test!(&too_deep, Err(ExceededMaximumDepth));

    let ok = format!("{}i{}", "(".repeat(32), ")".repeat(32));
    let too_deep = format!("{}i{}", "(".repeat(33), ")".repeat(33));
    test!(&ok, Ok(..));
    test!(&too_deep, Err(ExceededMaximumDepth));
}

#[test]
fn tree_shape() {
    let tree = SignatureTree::new("ia{sv}(iy)").unwrap();
    assert_eq!(tree.types().len(), 3);

    let dict = &tree.types()[1];
    assert_eq!(dict.code(), TypeCode::Array);
    let entry = &dict.children()[0];
    assert_eq!(entry.code(), TypeCode::DictEntry);
    assert_eq!(entry.children()[0].code(), TypeCode::String);
    assert_eq!(entry.children()[1].code(), TypeCode::Variant);

    let st = &tree.types()[2];
    assert_eq!(st.code(), TypeCode::Struct);
    assert_eq!(st.children().len(), 2);
}

#[test]
fn collapse_round_trips() {
    for signature in ["", "i", "as", "a{sv}", "(iy(d))", "aa{s(ai)}", "v", "h"] {
        let tree = SignatureTree::new(signature).unwrap();
        let spelled = tree
            .types()
            .iter()
            .map(|t| t.signature())
            .collect::<String>();
        assert_eq!(spelled, signature);
    }
}

#[test]
fn alignment_and_fixed_size() {
    let tree = SignatureTree::new("ybnqiuxtdsogh(i)vas").unwrap();

    let by_code = |c: char| {
        tree.types()
            .iter()
            .find(|t| t.code().as_char() == c)
            .unwrap()
    };

    assert_eq!(by_code('y').alignment(), 1);
    assert_eq!(by_code('b').alignment(), 4);
    assert_eq!(by_code('n').alignment(), 2);
    assert_eq!(by_code('q').alignment(), 2);
    assert_eq!(by_code('i').alignment(), 4);
    assert_eq!(by_code('u').alignment(), 4);
    assert_eq!(by_code('x').alignment(), 8);
    assert_eq!(by_code('t').alignment(), 8);
    assert_eq!(by_code('d').alignment(), 8);
    assert_eq!(by_code('s').alignment(), 4);
    assert_eq!(by_code('o').alignment(), 4);
    assert_eq!(by_code('g').alignment(), 1);
    assert_eq!(by_code('h').alignment(), 4);
    assert_eq!(by_code('a').alignment(), 4);
    assert_eq!(by_code('(').alignment(), 8);
    assert_eq!(by_code('v').alignment(), 1);

    assert!(by_code('y').is_fixed_size());
    assert!(by_code('t').is_fixed_size());
    assert!(by_code('(').is_fixed_size());
    assert!(!by_code('s').is_fixed_size());
    assert!(!by_code('a').is_fixed_size());
    assert!(!by_code('v').is_fixed_size());

    let tree = SignatureTree::new("(is)").unwrap();
    assert!(!tree.types()[0].is_fixed_size());
}

#[test]
fn cache_is_idempotent() {
    let a = SignatureTree::get("a{sv}").unwrap();
    let b = SignatureTree::get("a{sv}").unwrap();
    assert!(std::sync::Arc::ptr_eq(&a, &b));
    assert_eq!(*a, *b);

    assert!(SignatureTree::get("a{").is_err());
}

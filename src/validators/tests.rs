use super::*;

#[test]
fn bus_names() {
    assert!(is_bus_name_valid("org.freedesktop.DBus"));
    assert!(is_bus_name_valid("se.tedro.JapaneseDictionary"));
    assert!(is_bus_name_valid("a.b"));
    assert!(is_bus_name_valid("a-1.b-2"));
    assert!(is_bus_name_valid(":1.42"));
    assert!(is_bus_name_valid(":1.42.a"));

    assert!(!is_bus_name_valid(""));
    assert!(!is_bus_name_valid(":"));
    assert!(!is_bus_name_valid("org"));
    assert!(!is_bus_name_valid(".org.freedesktop.DBus"));
    assert!(!is_bus_name_valid("org..freedesktop"));
    assert!(!is_bus_name_valid("org.1freedesktop"));
    assert!(!is_bus_name_valid("org.freedesktop.DBus "));

    let long = format!("a.{}", "b".repeat(254));
    assert!(!is_bus_name_valid(&long));
}

#[test]
fn object_paths() {
    assert!(is_object_path_valid("/"));
    assert!(is_object_path_valid("/org"));
    assert!(is_object_path_valid("/org/freedesktop/DBus"));
    assert!(is_object_path_valid("/_1/a_2"));

    assert!(!is_object_path_valid(""));
    assert!(!is_object_path_valid("org/freedesktop"));
    assert!(!is_object_path_valid("/org/"));
    assert!(!is_object_path_valid("//org"));
    assert!(!is_object_path_valid("/org/free-desktop"));
    assert!(!is_object_path_valid("/org/free desktop"));
}

#[test]
fn interface_names() {
    assert!(is_interface_name_valid("org.freedesktop.DBus"));
    assert!(is_interface_name_valid("org.freedesktop.DBus.Properties"));
    assert!(is_interface_name_valid("a._b"));

    assert!(!is_interface_name_valid(""));
    assert!(!is_interface_name_valid("org"));
    assert!(!is_interface_name_valid(".org.freedesktop"));
    assert!(!is_interface_name_valid("org..freedesktop"));
    // Interface elements do not allow the hyphen bus names do.
    assert!(!is_interface_name_valid("org.free-desktop"));
    assert!(!is_interface_name_valid("org.1freedesktop"));
}

#[test]
fn member_names() {
    assert!(is_member_name_valid("Hello"));
    assert!(is_member_name_valid("_private"));
    assert!(is_member_name_valid("Name2"));

    assert!(!is_member_name_valid(""));
    assert!(!is_member_name_valid("With.Dot"));
    assert!(!is_member_name_valid("2Name"));
    assert!(!is_member_name_valid("has space"));
    assert!(!is_member_name_valid(&"m".repeat(256)));
}

#[test]
fn assert_variants() {
    assert!(assert_bus_name_valid("org.freedesktop.DBus").is_ok());
    assert!(assert_bus_name_valid("org").is_err());
    assert!(assert_object_path_valid("/").is_ok());
    assert!(assert_object_path_valid("").is_err());
    assert!(assert_interface_name_valid("a.b").is_ok());
    assert!(assert_interface_name_valid("a.b-c").is_err());
    assert!(assert_member_name_valid("Ping").is_ok());
    assert!(assert_member_name_valid("Ping!").is_err());
}

use lantern::{errors::ConfigError, Service};

#[test]
fn building_a_service_requires_name_type_and_port() {
    assert!(matches!(
        Service::builder("", "_http._tcp", 80).build(),
        Err(ConfigError::MissingName)
    ));
    assert!(matches!(
        Service::builder("web", "", 80).build(),
        Err(ConfigError::MissingType)
    ));
    assert!(matches!(
        Service::builder("web", "_http._tcp", 0).build(),
        Err(ConfigError::InvalidPort)
    ));
}

#[test]
fn dotted_instance_names_survive_the_wire_form() {
    let service = Service::builder("Dr. Smith.Office", "_http._tcp", 80)
        .host("smith")
        .build()
        .unwrap();

    // The dotted visible name travels as a single DNS label.
    let wire = service.instance_name();
    assert_eq!(wire.num_labels(), 4);
    assert_eq!(
        service.unescaped_instance_name(),
        "Dr. Smith.Office._http._tcp.local."
    );
}

#[test]
fn the_domain_defaults_to_local() {
    let service = Service::builder("web", "_http._tcp", 80)
        .host("server")
        .build()
        .unwrap();

    assert_eq!(service.domain(), "local");
    assert_eq!(service.hostname().to_utf8(), "server.local.");
}

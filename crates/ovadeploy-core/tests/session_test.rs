//! Tests for the vim25 SOAP session against a mock endpoint.

use httpmock::prelude::*;
use httpmock::Mock;
use ovadeploy_core::vim::soap::parse_document;
use ovadeploy_core::vim::{
    HostApi, ImportSpec, ImportSpecParams, KeyValue, LeaseState, ManagedObjectRef, NetworkMapping,
};
use ovadeploy_core::{ConnectionConfig, Error, VimSession};

fn envelope(body: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">"#,
            "<soapenv:Body>{}</soapenv:Body></soapenv:Envelope>"
        ),
        body
    )
}

fn fault(message: &str, kind: &str) -> String {
    envelope(&format!(
        r#"<soapenv:Fault><faultcode>ServerFaultCode</faultcode><faultstring>{message}</faultstring><detail><Fault xmlns="urn:vim25" xsi:type="{kind}"/></detail></soapenv:Fault>"#
    ))
}

fn soap_mock<'a>(server: &'a MockServer, method: &str, status: u16, reply: String) -> Mock<'a> {
    let marker = format!("<{method} xmlns=\"urn:vim25\">");
    server.mock(move |when, then| {
        when.method(POST).path("/sdk").body_includes(marker.as_str());
        then.status(status)
            .header("content-type", "text/xml; charset=utf-8")
            .body(reply);
    })
}

fn connected(server: &MockServer) -> VimSession {
    soap_mock(
        server,
        "RetrieveServiceContent",
        200,
        envelope(concat!(
            r#"<RetrieveServiceContentResponse xmlns="urn:vim25"><returnval>"#,
            r#"<rootFolder type="Folder">ha-folder-root</rootFolder>"#,
            r#"<propertyCollector type="PropertyCollector">ha-property-collector</propertyCollector>"#,
            r#"<viewManager type="ViewManager">ViewManager</viewManager>"#,
            r#"<about><name>VMware ESXi</name><apiVersion>7.0.3.0</apiVersion></about>"#,
            r#"<sessionManager type="SessionManager">ha-sessionmgr</sessionManager>"#,
            r#"<ovfManager type="OvfManager">ha-ovf-manager</ovfManager>"#,
            r#"</returnval></RetrieveServiceContentResponse>"#
        )),
    );
    let config = ConnectionConfig::new(server.address().to_string()).insecure_http();
    VimSession::connect(config).unwrap()
}

fn lease() -> ManagedObjectRef {
    ManagedObjectRef::new("HttpNfcLease", "52-1")
}

#[test]
fn test_connect_reads_service_content() {
    let server = MockServer::start();
    let session = connected(&server);

    let content = session.service_content();
    assert_eq!(content.root_folder, ManagedObjectRef::new("Folder", "ha-folder-root"));
    assert_eq!(content.ovf_manager.value, "ha-ovf-manager");
    assert_eq!(content.session_manager.kind, "SessionManager");
    assert!(!session.is_logged_in());
    assert_eq!(session.host_address(), server.address().to_string());
}

#[test]
fn test_soap_action_header() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/sdk")
            .header("soapaction", "urn:vim25/7.0")
            .body_includes("<_this type=\"ServiceInstance\">ServiceInstance</_this>");
        then.status(500).body("not a SOAP reply");
    });

    let config = ConnectionConfig::new(server.address().to_string()).insecure_http();
    let err = VimSession::connect(config).unwrap_err();

    mock.assert();
    assert!(matches!(err, Error::HostRejected { ref operation, ref message }
        if operation == "RetrieveServiceContent" && message.contains("500")), "got {err}");
}

#[test]
fn test_login_and_logout() {
    let server = MockServer::start();
    let mut session = connected(&server);
    let login = server.mock(|when, then| {
        when.method(POST)
            .path("/sdk")
            .body_includes("<Login xmlns=\"urn:vim25\">")
            .body_includes("<userName>root</userName>")
            .body_includes("<password>s3cr&amp;t</password>");
        then.status(200).body(envelope(
            r#"<LoginResponse xmlns="urn:vim25"><returnval><key>52a</key><userName>root</userName></returnval></LoginResponse>"#,
        ));
    });
    let logout = soap_mock(&server, "Logout", 200, envelope(r#"<LogoutResponse xmlns="urn:vim25"></LogoutResponse>"#));

    session.login("root", "s3cr&t").unwrap();
    assert!(session.is_logged_in());
    session.logout().unwrap();
    assert!(!session.is_logged_in());
    session.logout().unwrap();

    login.assert();
    logout.assert_hits(1);
}

fn login_mock(server: &MockServer) -> Mock<'_> {
    soap_mock(
        server,
        "Login",
        200,
        envelope(r#"<LoginResponse xmlns="urn:vim25"><returnval><key>52a</key></returnval></LoginResponse>"#),
    )
}

#[test]
fn test_drop_logs_out() {
    let server = MockServer::start();
    login_mock(&server);
    let logout = soap_mock(&server, "Logout", 200, envelope(r#"<LogoutResponse xmlns="urn:vim25"></LogoutResponse>"#));

    let lookup_failed = {
        let mut session = connected(&server);
        session.login("root", "secret").unwrap();
        soap_mock(&server, "CreateContainerView", 500, fault("Permission denied", "NoPermission"));
        session.find("Datastore", "datastore1").is_err()
    };

    assert!(lookup_failed);
    logout.assert_hits(1);
}

#[test]
fn test_drop_without_login_sends_nothing() {
    let server = MockServer::start();
    let logout = soap_mock(&server, "Logout", 200, envelope(r#"<LogoutResponse xmlns="urn:vim25"></LogoutResponse>"#));

    drop(connected(&server));

    logout.assert_hits(0);
}

#[test]
fn test_failed_logout_not_repeated_on_drop() {
    let server = MockServer::start();
    login_mock(&server);
    let logout = soap_mock(&server, "Logout", 500, fault("Session gone", "NotAuthenticated"));

    let mut session = connected(&server);
    session.login("root", "secret").unwrap();
    assert!(session.logout().is_err());
    assert!(!session.is_logged_in());
    drop(session);

    logout.assert_hits(1);
}

#[test]
fn test_login_fault() {
    let server = MockServer::start();
    let mut session = connected(&server);
    soap_mock(
        &server,
        "Login",
        500,
        fault("Cannot complete login due to an incorrect user name or password.", "InvalidLogin"),
    );

    let err = session.login("root", "wrong").unwrap_err();
    match err {
        Error::HostRejected { operation, message } => {
            assert_eq!(operation, "Login");
            assert!(message.contains("incorrect user name"));
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(!session.is_logged_in());
}

#[test]
fn test_networks_through_container_view() {
    let server = MockServer::start();
    let session = connected(&server);
    let create = server.mock(|when, then| {
        when.method(POST)
            .path("/sdk")
            .body_includes("<CreateContainerView xmlns=\"urn:vim25\">")
            .body_includes("<type>Network</type>");
        then.status(200).body(envelope(
            r#"<CreateContainerViewResponse xmlns="urn:vim25"><returnval type="ContainerView">session[52a]52b</returnval></CreateContainerViewResponse>"#,
        ));
    });
    let first = server.mock(|when, then| {
        when.method(POST)
            .path("/sdk")
            .body_includes("<RetrievePropertiesEx xmlns=\"urn:vim25\">")
            .body_includes("<path>view</path>");
        then.status(200).body(envelope(concat!(
            r#"<RetrievePropertiesExResponse xmlns="urn:vim25"><returnval><token>1</token>"#,
            r#"<objects><obj type="Network">HaNetwork-VM Network</obj>"#,
            r#"<propSet><name>name</name><val xsi:type="xsd:string">VM Network</val></propSet></objects>"#,
            r#"</returnval></RetrievePropertiesExResponse>"#
        )));
    });
    let next = server.mock(|when, then| {
        when.method(POST)
            .path("/sdk")
            .body_includes("<ContinueRetrievePropertiesEx xmlns=\"urn:vim25\">")
            .body_includes("<token>1</token>");
        then.status(200).body(envelope(concat!(
            r#"<ContinueRetrievePropertiesExResponse xmlns="urn:vim25"><returnval>"#,
            r#"<objects><obj type="DistributedVirtualPortgroup">dvportgroup-7</obj>"#,
            r#"<propSet><name>name</name><val xsi:type="xsd:string">Storage</val></propSet></objects>"#,
            r#"</returnval></ContinueRetrievePropertiesExResponse>"#
        )));
    });
    let destroy = server.mock(|when, then| {
        when.method(POST)
            .path("/sdk")
            .body_includes("<DestroyView xmlns=\"urn:vim25\">")
            .body_includes("session[52a]52b");
        then.status(200).body(envelope(r#"<DestroyViewResponse xmlns="urn:vim25"></DestroyViewResponse>"#));
    });

    let networks = session.networks().unwrap();

    create.assert();
    first.assert();
    next.assert();
    destroy.assert();
    let names: Vec<&str> = networks.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["VM Network", "Storage"]);
    assert_eq!(networks[1].reference.kind, "DistributedVirtualPortgroup");

    let found = session.find("Network", "Storage").unwrap();
    assert_eq!(found.reference.value, "dvportgroup-7");
    assert!(matches!(session.find("Network", "Missing"), Err(Error::Config { .. })));
}

#[test]
fn test_datacenters_and_datastore() {
    let server = MockServer::start();
    let session = connected(&server);
    soap_mock(
        &server,
        "CreateContainerView",
        200,
        envelope(r#"<CreateContainerViewResponse xmlns="urn:vim25"><returnval type="ContainerView">session[1]2</returnval></CreateContainerViewResponse>"#),
    );
    soap_mock(&server, "DestroyView", 200, envelope(r#"<DestroyViewResponse xmlns="urn:vim25"/>"#));
    server.mock(|when, then| {
        when.method(POST)
            .path("/sdk")
            .body_includes("<RetrievePropertiesEx xmlns=\"urn:vim25\">")
            .body_includes("<type>Datacenter</type>");
        then.status(200).body(envelope(concat!(
            r#"<RetrievePropertiesExResponse xmlns="urn:vim25"><returnval>"#,
            r#"<objects><obj type="Datacenter">ha-datacenter</obj>"#,
            r#"<propSet><name>name</name><val xsi:type="xsd:string">ha-datacenter</val></propSet>"#,
            r#"<propSet><name>vmFolder</name><val type="Folder" xsi:type="ManagedObjectReference">ha-folder-vm</val></propSet>"#,
            r#"</objects></returnval></RetrievePropertiesExResponse>"#
        )));
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/sdk")
            .body_includes("<RetrievePropertiesEx xmlns=\"urn:vim25\">")
            .body_includes(r#"<obj type="Datastore">datastore-11</obj>"#);
        then.status(200).body(envelope(concat!(
            r#"<RetrievePropertiesExResponse xmlns="urn:vim25"><returnval>"#,
            r#"<objects><obj type="Datastore">datastore-11</obj>"#,
            r#"<propSet><name>name</name><val xsi:type="xsd:string">datastore1</val></propSet>"#,
            r#"</objects></returnval></RetrievePropertiesExResponse>"#
        )));
    });

    let datacenters = session.datacenters().unwrap();
    assert_eq!(datacenters.len(), 1);
    assert_eq!(datacenters[0].object.name, "ha-datacenter");
    assert_eq!(datacenters[0].vm_folder, ManagedObjectRef::new("Folder", "ha-folder-vm"));
    assert_eq!(session.datacenter().unwrap().name, "ha-datacenter");

    let datastore = session
        .datastore(&ManagedObjectRef::new("Datastore", "datastore-11"))
        .unwrap();
    assert_eq!(datastore.name, "datastore1");
}

#[test]
fn test_create_import_spec_request_and_warnings() {
    let server = MockServer::start();
    let session = connected(&server);
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/sdk")
            .body_includes("<CreateImportSpec xmlns=\"urn:vim25\">")
            .body_includes("<ovfDescriptor>&lt;Envelope/&gt;</ovfDescriptor>")
            .body_includes(r#"<resourcePool type="ResourcePool">ha-root-pool</resourcePool>"#)
            .body_includes("<cisp><locale>US</locale><deploymentOption>small</deploymentOption><entityName>web01</entityName>")
            .body_includes(r#"<networkMapping><name>VM Network</name><network type="Network">HaNetwork-VM Network</network></networkMapping>"#)
            .body_includes("<propertyMapping><key>guestinfo.ip</key><value>10.0.0.5</value></propertyMapping>");
        then.status(200).body(envelope(concat!(
            r#"<CreateImportSpecResponse xmlns="urn:vim25"><returnval>"#,
            r#"<importSpec xsi:type="VirtualMachineImportSpec"><configSpec><name>web01</name><memoryMB>1024</memoryMB></configSpec></importSpec>"#,
            r#"<warning><fault xsi:type="OvfUnsupportedElement"/><localizedMessage>Line 40: Unsupported element 'Foo'</localizedMessage></warning>"#,
            r#"</returnval></CreateImportSpecResponse>"#
        )));
    });

    let params = ImportSpecParams {
        entity_name: "web01".to_string(),
        host: ManagedObjectRef::new("HostSystem", "ha-host"),
        locale: "US".to_string(),
        deployment_option: "small".to_string(),
        network_mappings: vec![NetworkMapping {
            name: "VM Network".to_string(),
            network: ManagedObjectRef::new("Network", "HaNetwork-VM Network"),
        }],
        property_mappings: vec![KeyValue::new("guestinfo.ip", "10.0.0.5")],
        disk_provisioning: String::new(),
    };
    let spec = session
        .create_import_spec(
            "<Envelope/>",
            &ManagedObjectRef::new("ResourcePool", "ha-root-pool"),
            &ManagedObjectRef::new("Datastore", "datastore-11"),
            &params,
        )
        .unwrap();

    mock.assert();
    assert_eq!(spec.warnings, vec!["Line 40: Unsupported element 'Foo'".to_string()]);
    assert_eq!(spec.spec.attr("type"), Some("VirtualMachineImportSpec"));
}

#[test]
fn test_create_import_spec_error_entries() {
    let server = MockServer::start();
    let session = connected(&server);
    soap_mock(
        &server,
        "CreateImportSpec",
        200,
        envelope(concat!(
            r#"<CreateImportSpecResponse xmlns="urn:vim25"><returnval>"#,
            r#"<error><fault xsi:type="OvfUnsupportedPackage"/><localizedMessage>Unsupported hardware family 'vmx-99'.</localizedMessage></error>"#,
            r#"</returnval></CreateImportSpecResponse>"#
        )),
    );

    let params = ImportSpecParams {
        entity_name: "web01".to_string(),
        host: ManagedObjectRef::new("HostSystem", "ha-host"),
        locale: "US".to_string(),
        deployment_option: String::new(),
        network_mappings: Vec::new(),
        property_mappings: Vec::new(),
        disk_provisioning: String::new(),
    };
    let err = session
        .create_import_spec(
            "<Envelope/>",
            &ManagedObjectRef::new("ResourcePool", "ha-root-pool"),
            &ManagedObjectRef::new("Datastore", "datastore-11"),
            &params,
        )
        .unwrap_err();

    assert!(matches!(err, Error::HostRejected { ref message, .. } if message.contains("vmx-99")), "got {err}");
}

#[test]
fn test_import_vapp_sends_spec() {
    let server = MockServer::start();
    let session = connected(&server);
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/sdk")
            .body_includes(r#"<ImportVApp xmlns="urn:vim25"><_this type="ResourcePool">ha-root-pool</_this>"#)
            .body_includes(r#"<spec xsi:type="VirtualMachineImportSpec"><configSpec><name>web01</name></configSpec></spec>"#)
            .body_includes(r#"<folder type="Folder">ha-folder-vm</folder>"#)
            .body_includes(r#"<host type="HostSystem">ha-host</host>"#);
        then.status(200).body(envelope(
            r#"<ImportVAppResponse xmlns="urn:vim25"><returnval type="HttpNfcLease">52-1</returnval></ImportVAppResponse>"#,
        ));
    });

    let spec = ImportSpec {
        spec: parse_document(
            r#"<importSpec xsi:type="VirtualMachineImportSpec"><configSpec><name>web01</name></configSpec></importSpec>"#,
        )
        .unwrap(),
        warnings: Vec::new(),
    };
    let lease_ref = session
        .import_vapp(
            &ManagedObjectRef::new("ResourcePool", "ha-root-pool"),
            &spec,
            &ManagedObjectRef::new("Folder", "ha-folder-vm"),
            &ManagedObjectRef::new("HostSystem", "ha-host"),
        )
        .unwrap();

    mock.assert();
    assert_eq!(lease_ref, lease());
}

#[test]
fn test_lease_snapshot() {
    let server = MockServer::start();
    let session = connected(&server);
    server.mock(|when, then| {
        when.method(POST)
            .path("/sdk")
            .body_includes("<RetrievePropertiesEx xmlns=\"urn:vim25\">")
            .body_includes("<pathSet>state</pathSet><pathSet>info</pathSet><pathSet>error</pathSet>");
        then.status(200).body(envelope(concat!(
            r#"<RetrievePropertiesExResponse xmlns="urn:vim25"><returnval>"#,
            r#"<objects><obj type="HttpNfcLease">52-1</obj>"#,
            r#"<propSet><name>info</name><val xsi:type="HttpNfcLeaseInfo"><lease type="HttpNfcLease">52-1</lease>"#,
            r#"<deviceUrl><key>/vm-9/VirtualLsiLogicController0:0</key><importKey>/web01/VirtualLsiLogicController0:0</importKey>"#,
            r#"<url>https://*/nfc/52-1/disk-0.vmdk</url><sslThumbprint>AA:BB</sslThumbprint><disk>true</disk>"#,
            r#"<targetId>disk-0.vmdk</targetId></deviceUrl></val></propSet>"#,
            r#"<propSet><name>state</name><val xsi:type="HttpNfcLeaseState">ready</val></propSet>"#,
            r#"</objects></returnval></RetrievePropertiesExResponse>"#
        )));
    });

    let snapshot = session.lease_snapshot(&lease()).unwrap();

    assert_eq!(snapshot.state, LeaseState::Ready);
    assert_eq!(snapshot.transfer_url(), Some("https://*/nfc/52-1/disk-0.vmdk"));
    assert_eq!(snapshot.device_urls[0].import_key, "/web01/VirtualLsiLogicController0:0");
    assert_eq!(snapshot.error, None);
}

#[test]
fn test_lease_progress_and_complete() {
    let server = MockServer::start();
    let session = connected(&server);
    let progress = server.mock(|when, then| {
        when.method(POST)
            .path("/sdk")
            .body_includes("<HttpNfcLeaseProgress xmlns=\"urn:vim25\">")
            .body_includes("<percent>50</percent>");
        then.status(200).body(envelope(r#"<HttpNfcLeaseProgressResponse xmlns="urn:vim25"/>"#));
    });
    soap_mock(
        &server,
        "HttpNfcLeaseComplete",
        500,
        fault("The operation is not allowed in the current state.", "InvalidState"),
    );

    session.lease_progress(&lease(), 50).unwrap();
    progress.assert();

    let err = session.complete_lease(&lease()).unwrap_err();
    assert!(matches!(err, Error::HostRejected { ref operation, ref message }
        if operation == "HttpNfcLeaseComplete" && message.contains("InvalidState")), "got {err}");
}

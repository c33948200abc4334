//! vim25 SOAP session.
//!
//! A [`VimSession`] owns the HTTP client (and with it the session cookie), the
//! service content references and the host address. It is created with
//! [`VimSession::connect`], authenticated with [`VimSession::login`] and
//! closed with [`VimSession::logout`]; every component borrows it.

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

use super::soap::{self, element, localized_fault, ref_element, Request, XmlNode};
use super::{
    Datacenter, DeviceUrl, HostApi, ImportSpec, ImportSpecParams, InventoryObject, LeaseSnapshot,
    LeaseState, ManagedObjectRef,
};

/// References from the host's `ServiceContent` the session uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContent {
    pub root_folder: ManagedObjectRef,
    pub property_collector: ManagedObjectRef,
    pub view_manager: ManagedObjectRef,
    pub session_manager: ManagedObjectRef,
    pub ovf_manager: ManagedObjectRef,
}

impl ServiceContent {
    fn from_response(response: &XmlNode) -> Result<Self> {
        let content = response
            .child("returnval")
            .ok_or_else(|| Error::soap("RetrieveServiceContent: no returnval"))?;
        let reference = |name: &str| {
            content
                .child(name)
                .and_then(XmlNode::as_ref_value)
                .ok_or_else(|| Error::soap(format!("service content lacks {name}")))
        };
        Ok(Self {
            root_folder: reference("rootFolder")?,
            property_collector: reference("propertyCollector")?,
            view_manager: reference("viewManager")?,
            session_manager: reference("sessionManager")?,
            ovf_manager: reference("ovfManager")?,
        })
    }
}

/// One object returned by the property collector.
#[derive(Debug, Clone)]
struct ObjectContent {
    obj: ManagedObjectRef,
    props: Vec<(String, XmlNode)>,
}

impl ObjectContent {
    fn prop(&self, name: &str) -> Option<&XmlNode> {
        self.props.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    fn prop_text(&self, name: &str) -> Option<&str> {
        self.prop(name).map(|v| v.text.as_str())
    }
}

/// An explicit session with a host's vim25 endpoint.
///
/// Dropping a logged-in session sends `Logout`, so the host session ends on
/// every exit path of the code that opened it.
#[derive(Debug)]
pub struct VimSession {
    http: Client,
    config: ConnectionConfig,
    content: ServiceContent,
    user: Option<String>,
}

impl VimSession {
    /// Build the HTTP client and fetch the service content.
    ///
    /// The client keeps cookies, so once [`login`](Self::login) succeeds the
    /// same client authenticates uploads made through
    /// [`TransferClient`](crate::transfer::TransferClient).
    pub fn connect(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;

        let http = Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(config.request_timeout)
            .build()?;

        let this = ManagedObjectRef::new("ServiceInstance", "ServiceInstance");
        let response = call(&http, &config, Request::new("RetrieveServiceContent", &this))?;
        let content = ServiceContent::from_response(&response)?;

        debug!(host = %config.host, "connected");
        Ok(Self {
            http,
            config,
            content,
            user: None,
        })
    }

    pub fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let mut request = Request::new("Login", &self.content.session_manager);
        request.push_text("userName", user).push_text("password", password);
        self.call(request)?;

        info!(host = %self.config.host, user, "logged in");
        self.user = Some(user.to_string());
        Ok(())
    }

    /// End the session. A failed `Logout` is not retried, also not on drop.
    pub fn logout(&mut self) -> Result<()> {
        if self.user.take().is_none() {
            return Ok(());
        }
        self.call(Request::new("Logout", &self.content.session_manager))?;
        info!(host = %self.config.host, "logged out");
        Ok(())
    }

    pub fn is_logged_in(&self) -> bool {
        self.user.is_some()
    }

    pub fn service_content(&self) -> &ServiceContent {
        &self.content
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The session's HTTP client, carrying the session cookie.
    pub fn http_client(&self) -> &Client {
        &self.http
    }

    /// Names and references of every object of `kind` in the inventory.
    pub fn list(&self, kind: &str) -> Result<Vec<InventoryObject>> {
        self.retrieve_view(kind, &["name"])?
            .into_iter()
            .map(|oc| {
                let name = oc
                    .prop_text("name")
                    .ok_or_else(|| Error::soap(format!("{} has no name", oc.obj)))?
                    .to_string();
                Ok(InventoryObject::new(oc.obj, name))
            })
            .collect()
    }

    /// Find an object of `kind` by exact name.
    pub fn find(&self, kind: &str, name: &str) -> Result<InventoryObject> {
        self.list(kind)?
            .into_iter()
            .find(|o| o.name == name)
            .ok_or_else(|| Error::config(format!("no {kind} named '{name}' on the host")))
    }

    pub fn networks(&self) -> Result<Vec<InventoryObject>> {
        self.list("Network")
    }

    pub fn datacenters(&self) -> Result<Vec<Datacenter>> {
        self.retrieve_view("Datacenter", &["name", "vmFolder"])?
            .into_iter()
            .map(|oc| {
                let name = oc
                    .prop_text("name")
                    .ok_or_else(|| Error::soap(format!("{} has no name", oc.obj)))?
                    .to_string();
                let vm_folder = oc
                    .prop("vmFolder")
                    .and_then(XmlNode::as_ref_value)
                    .ok_or_else(|| Error::soap(format!("{} has no vmFolder", oc.obj)))?;
                Ok(Datacenter {
                    object: InventoryObject::new(oc.obj, name),
                    vm_folder,
                })
            })
            .collect()
    }

    fn call(&self, request: Request) -> Result<XmlNode> {
        call(&self.http, &self.config, request)
    }

    /// Create a container view of `kind`, read `paths` of every object in it
    /// and destroy the view again.
    fn retrieve_view(&self, kind: &str, paths: &[&str]) -> Result<Vec<ObjectContent>> {
        let mut request = Request::new("CreateContainerView", &self.content.view_manager);
        request
            .push_ref("container", &self.content.root_folder)
            .push_text("type", kind)
            .push_text("recursive", "true");
        let view = self
            .call(request)?
            .child("returnval")
            .and_then(XmlNode::as_ref_value)
            .ok_or_else(|| Error::soap("CreateContainerView: no view returned"))?;

        let spec_set = format!(
            "<specSet>{}<objectSet>{}{}<selectSet xsi:type=\"TraversalSpec\">{}{}{}{}</selectSet></objectSet></specSet>",
            property_spec(kind, paths),
            ref_element("obj", &view),
            element("skip", "true"),
            element("name", "traverseEntities"),
            element("type", "ContainerView"),
            element("path", "view"),
            element("skip", "false"),
        );
        let result = self.retrieve_properties(&spec_set);

        if let Err(e) = self.call(Request::new("DestroyView", &view)) {
            warn!(view = %view, error = %e, "failed to destroy container view");
        }
        result
    }

    /// Read `paths` of a single object.
    fn retrieve_object(&self, obj: &ManagedObjectRef, paths: &[&str]) -> Result<ObjectContent> {
        let spec_set = format!(
            "<specSet>{}<objectSet>{}{}</objectSet></specSet>",
            property_spec(&obj.kind, paths),
            ref_element("obj", obj),
            element("skip", "false"),
        );
        self.retrieve_properties(&spec_set)?
            .into_iter()
            .find(|oc| &oc.obj == obj)
            .ok_or_else(|| Error::soap(format!("no properties returned for {obj}")))
    }

    fn retrieve_properties(&self, spec_set: &str) -> Result<Vec<ObjectContent>> {
        let collector = &self.content.property_collector;
        let mut request = Request::new("RetrievePropertiesEx", collector);
        request.push_raw(spec_set).push_raw("<options></options>");

        let mut objects = Vec::new();
        let response = self.call(request)?;
        let mut token = collect_objects(response.child("returnval"), &mut objects)?;

        while let Some(t) = token {
            let mut request = Request::new("ContinueRetrievePropertiesEx", collector);
            request.push_text("token", &t);
            let response = self.call(request)?;
            token = collect_objects(response.child("returnval"), &mut objects)?;
        }

        Ok(objects)
    }
}

impl Drop for VimSession {
    fn drop(&mut self) {
        if let Err(e) = self.logout() {
            warn!(host = %self.config.host, error = %e, "logout on drop failed");
        }
    }
}

impl HostApi for VimSession {
    fn host_address(&self) -> &str {
        &self.config.host
    }

    fn datacenter(&self) -> Result<InventoryObject> {
        self.datacenters()?
            .into_iter()
            .next()
            .map(|dc| dc.object)
            .ok_or_else(|| Error::soap("host reports no datacenter"))
    }

    fn datastore(&self, reference: &ManagedObjectRef) -> Result<InventoryObject> {
        let oc = self.retrieve_object(reference, &["name"])?;
        let name = oc
            .prop_text("name")
            .ok_or_else(|| Error::soap(format!("{reference} has no name")))?
            .to_string();
        Ok(InventoryObject::new(reference.clone(), name))
    }

    fn create_import_spec(
        &self,
        descriptor: &str,
        resource_pool: &ManagedObjectRef,
        datastore: &ManagedObjectRef,
        params: &ImportSpecParams,
    ) -> Result<ImportSpec> {
        let mut request = Request::new("CreateImportSpec", &self.content.ovf_manager);
        request
            .push_text("ovfDescriptor", descriptor)
            .push_ref("resourcePool", resource_pool)
            .push_ref("datastore", datastore)
            .push_raw(&import_spec_params_xml(params));

        let response = self.call(request)?;
        import_spec_from_response(&response)
    }

    fn import_vapp(
        &self,
        resource_pool: &ManagedObjectRef,
        spec: &ImportSpec,
        folder: &ManagedObjectRef,
        host: &ManagedObjectRef,
    ) -> Result<ManagedObjectRef> {
        let mut request = Request::new("ImportVApp", resource_pool);
        request
            .push_raw(&spec.spec.to_xml_as("spec"))
            .push_ref("folder", folder)
            .push_ref("host", host);

        self.call(request)?
            .child("returnval")
            .and_then(XmlNode::as_ref_value)
            .ok_or_else(|| Error::soap("ImportVApp: no lease returned"))
    }

    fn lease_snapshot(&self, lease: &ManagedObjectRef) -> Result<LeaseSnapshot> {
        let oc = self.retrieve_object(lease, &["state", "info", "error"])?;
        lease_snapshot_from(lease, &oc)
    }

    fn lease_progress(&self, lease: &ManagedObjectRef, percent: u8) -> Result<()> {
        let mut request = Request::new("HttpNfcLeaseProgress", lease);
        request.push_text("percent", &percent.min(100).to_string());
        self.call(request)?;
        Ok(())
    }

    fn complete_lease(&self, lease: &ManagedObjectRef) -> Result<()> {
        self.call(Request::new("HttpNfcLeaseComplete", lease))?;
        Ok(())
    }
}

/// Post one request and unwrap its response element.
fn call(http: &Client, config: &ConnectionConfig, request: Request) -> Result<XmlNode> {
    let method = request.method();
    debug!(method, "SOAP call");

    let response = http
        .post(config.sdk_url())
        .header(CONTENT_TYPE, "text/xml; charset=utf-8")
        .header("SOAPAction", format!("urn:vim25/{}", config.api_version))
        .body(request.into_envelope())
        .send()?;
    let status = response.status();
    let text = response.text()?;

    match soap::parse_response(&text, method) {
        Err(Error::Soap { message }) if !status.is_success() => Err(Error::host_rejected(
            method,
            format!("HTTP {status} ({message})"),
        )),
        other => other,
    }
}

fn property_spec(kind: &str, paths: &[&str]) -> String {
    let mut xml = String::from("<propSet>");
    xml.push_str(&element("type", kind));
    for path in paths {
        xml.push_str(&element("pathSet", path));
    }
    xml.push_str("</propSet>");
    xml
}

/// Append the `objects` of a `RetrieveResult` and return its continuation token.
fn collect_objects(result: Option<&XmlNode>, out: &mut Vec<ObjectContent>) -> Result<Option<String>> {
    let Some(result) = result else {
        return Ok(None);
    };

    for object in result.children_named("objects") {
        let obj = object
            .child("obj")
            .and_then(XmlNode::as_ref_value)
            .ok_or_else(|| Error::soap("ObjectContent without obj"))?;
        let props = object
            .children_named("propSet")
            .filter_map(|p| Some((p.child_text("name")?.to_string(), p.child("val")?.clone())))
            .collect();
        out.push(ObjectContent { obj, props });
    }

    Ok(result
        .child_text("token")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string))
}

/// The `cisp` argument of `CreateImportSpec`, in schema order.
pub(crate) fn import_spec_params_xml(params: &ImportSpecParams) -> String {
    let mut xml = String::from("<cisp>");
    xml.push_str(&element("locale", &params.locale));
    xml.push_str(&element("deploymentOption", &params.deployment_option));
    xml.push_str(&element("entityName", &params.entity_name));
    xml.push_str(&ref_element("hostSystem", &params.host));
    for mapping in &params.network_mappings {
        xml.push_str("<networkMapping>");
        xml.push_str(&element("name", &mapping.name));
        xml.push_str(&ref_element("network", &mapping.network));
        xml.push_str("</networkMapping>");
    }
    for property in &params.property_mappings {
        xml.push_str("<propertyMapping>");
        xml.push_str(&element("key", &property.key));
        xml.push_str(&element("value", &property.value));
        xml.push_str("</propertyMapping>");
    }
    if !params.disk_provisioning.is_empty() {
        xml.push_str(&element("diskProvisioning", &params.disk_provisioning));
    }
    xml.push_str("</cisp>");
    xml
}

/// Turn a `CreateImportSpecResponse` into an [`ImportSpec`].
///
/// Error entries in the result are host rejections even though the call
/// itself succeeded.
pub(crate) fn import_spec_from_response(response: &XmlNode) -> Result<ImportSpec> {
    let result = response
        .child("returnval")
        .ok_or_else(|| Error::soap("CreateImportSpec: no returnval"))?;

    let errors: Vec<String> = result.children_named("error").map(localized_fault).collect();
    if !errors.is_empty() {
        return Err(Error::host_rejected("CreateImportSpec", errors.join("; ")));
    }

    let warnings: Vec<String> = result.children_named("warning").map(localized_fault).collect();
    let spec = result
        .child("importSpec")
        .cloned()
        .ok_or_else(|| Error::host_rejected("CreateImportSpec", "host returned no import spec"))?;

    Ok(ImportSpec { spec, warnings })
}

fn lease_snapshot_from(lease: &ManagedObjectRef, oc: &ObjectContent) -> Result<LeaseSnapshot> {
    let state = oc
        .prop_text("state")
        .map(|s| LeaseState::parse(s.trim()))
        .ok_or_else(|| Error::soap(format!("{lease} has no state")))?;

    let device_urls = oc
        .prop("info")
        .map(|info| {
            info.children_named("deviceUrl")
                .map(|d| DeviceUrl {
                    key: d.child_text("key").unwrap_or_default().to_string(),
                    import_key: d.child_text("importKey").unwrap_or_default().to_string(),
                    url: d.child_text("url").unwrap_or_default().to_string(),
                    target_id: d.child_text("targetId").map(str::to_string),
                    disk: d.child_text("disk") == Some("true"),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(LeaseSnapshot {
        lease: lease.clone(),
        state,
        device_urls,
        error: oc.prop("error").map(localized_fault),
    })
}

//! VM name rendering and per-instantiation template attributes.

use flowgrid_state::{Role, Service};

/// Substitute `$SERVICE_ID`, `$SERVICE_NAME`, `$ROLE_NAME` and `$VM_NUMBER`.
pub fn render_vm_name(template: &str, service: &Service, role: &str, vm_number: u64) -> String {
    template
        .replace("$SERVICE_ID", &service.id.to_string())
        .replace("$SERVICE_NAME", &service.name)
        .replace("$ROLE_NAME", role)
        .replace("$VM_NUMBER", &vm_number.to_string())
}

/// The role's template contents followed by the attributes that tie the VM
/// back to its service and role.
pub fn extra_template(service: &Service, role: &Role) -> String {
    let mut extra = role.vm_template_contents.clone().unwrap_or_default();
    if !extra.is_empty() && !extra.ends_with('\n') {
        extra.push('\n');
    }
    extra.push_str(&format!("SERVICE_ID = {}\n", service.id));
    extra.push_str(&format!("ROLE_NAME = \"{}\"", role.name));
    extra
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgrid_core::config::DEFAULT_VM_NAME_TEMPLATE;

    #[test]
    fn default_template_renders_all_tokens() {
        let svc = Service::new(42, "shop", vec![]);
        let name = render_vm_name(DEFAULT_VM_NAME_TEMPLATE, &svc, "web", 3);
        assert_eq!(name, "web_3_(service_42)");
    }

    #[test]
    fn service_name_token() {
        let svc = Service::new(1, "shop", vec![]);
        assert_eq!(render_vm_name("$SERVICE_NAME-$ROLE_NAME", &svc, "db", 0), "shop-db");
    }

    #[test]
    fn extra_template_appends_identity() {
        let svc = Service::new(9, "shop", vec![]);
        let mut role = Role::new("web", 0, 1);
        assert_eq!(extra_template(&svc, &role), "SERVICE_ID = 9\nROLE_NAME = \"web\"");

        role.vm_template_contents = Some("MEMORY = 512".to_string());
        assert_eq!(
            extra_template(&svc, &role),
            "MEMORY = 512\nSERVICE_ID = 9\nROLE_NAME = \"web\""
        );
    }
}

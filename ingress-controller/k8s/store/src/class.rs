use ingress_controller_k8s_api::{Ingress, IngressClass, ResourceExt, INGRESS_CLASS_ANNOTATION};

/// Class assigned to routes that carry no class when those are watched.
pub const WITHOUT_CLASS: &str = "_";

/// Decides which routes belong to this controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassConfig {
    /// The `spec.controller` value of IngressClasses we own.
    pub controller: String,
    /// The legacy annotation value we own. Also a class name when
    /// `by_name` is set.
    pub annotation_value: String,
    pub watch_without_class: bool,
    pub by_name: bool,
    /// Admit every route regardless of class.
    pub ignore_class: bool,
}

impl Default for ClassConfig {
    fn default() -> Self {
        Self {
            controller: "k8s.io/ingress-nginx".to_string(),
            annotation_value: "nginx".to_string(),
            watch_without_class: false,
            by_name: false,
            ignore_class: false,
        }
    }
}

impl ClassConfig {
    /// True when `class` is served by this controller.
    pub fn accepts_class(&self, class: &IngressClass) -> bool {
        let controller = class.spec.as_ref().and_then(|s| s.controller.as_deref());
        controller == Some(self.controller.as_str())
            || (self.by_name && class.name_any() == self.annotation_value)
    }

    /// Returns the class a route is admitted under, or `None` when the route
    /// belongs to another controller. `known` reports whether an accepted
    /// IngressClass of the given name is cached.
    pub fn resolve(&self, route: &Ingress, known: impl Fn(&str) -> bool) -> Option<String> {
        if self.ignore_class {
            return Some(WITHOUT_CLASS.to_string());
        }

        let name = route
            .spec
            .as_ref()
            .and_then(|s| s.ingress_class_name.as_deref());
        if let Some(name) = name {
            return known(name).then(|| name.to_string());
        }

        if let Some(value) = route.annotations().get(INGRESS_CLASS_ANNOTATION) {
            return (*value == self.annotation_value).then(|| value.clone());
        }

        self.watch_without_class.then(|| WITHOUT_CLASS.to_string())
    }
}

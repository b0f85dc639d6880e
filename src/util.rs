use std::num::NonZeroU32;

pub fn iface_name_to_index(name: &str) -> Option<NonZeroU32> {
    use std::ffi::CString;

    #[cfg(windows)]
    use winapi::shared::netioapi::if_nametoindex;

    #[cfg(not(windows))]
    extern "C" {
        fn if_nametoindex(ifname: *const std::ffi::c_char) -> u32;
    }

    let name = CString::new(name).ok()?;
    let index = unsafe { if_nametoindex(name.as_ptr()) };
    NonZeroU32::new(index)
}

/// The default host label: the OS host name up to the first '.', with
/// spaces replaced by '-'. Falls back to "unknown".
pub fn local_host_label() -> String {
    let name = match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(_) => return "unknown".to_owned(),
    };

    let label = name.split('.').next().unwrap_or("unknown");
    sanitize_host_label(label)
}

pub fn sanitize_host_label(label: &str) -> String {
    label.replace(' ', "-")
}

#[cfg(test)]
mod tests {
    use super::sanitize_host_label;

    #[test]
    fn host_label_spaces_become_dashes() {
        assert_eq!(sanitize_host_label("My Computer"), "My-Computer");
        assert_eq!(sanitize_host_label("plain"), "plain");
    }
}

#![no_main]

use libfuzzer_sys::fuzz_target;
use xfrmguard_policy_table::{decode_policy, encode_policy_info};

fuzz_target!(|data: &[u8]| {
    // 임의의 XFRM_MSG_NEWPOLICY payload는 panic 없이 디코딩되어야 함
    if let Ok(Some(policy)) = decode_policy(data) {
        let _ = policy.to_string();

        // 디코딩된 정책은 다시 인코딩해도 같은 정책으로 읽혀야 함
        let again = decode_policy(&encode_policy_info(&policy));
        assert_eq!(again, Ok(Some(policy)));
    }
});
